//! Сопоставление потоков по атрибутам (домен + ключ + QoS).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rwf_core::{DomainType, MsgKey, Qos, StreamId};

/// Всё, что делает два запроса "одним и тем же" потоком.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAttributes {
    pub domain_type: DomainType,
    pub msg_key: MsgKey,
    pub qos: Option<Qos>,
}

impl StreamAttributes {
    pub fn new(domain_type: DomainType, msg_key: MsgKey, qos: Option<Qos>) -> Self {
        Self {
            domain_type,
            msg_key,
            qos,
        }
    }

    /// Домен и ключ должны совпасть полностью, QoS сравнивается только если
    /// он есть с обеих сторон (в ответах провайдера QoS обычно нет).
    pub fn matches(&self, other: &StreamAttributes) -> bool {
        if self.domain_type != other.domain_type {
            return false;
        }

        if let (Some(a), Some(b)) = (&self.qos, &other.qos) {
            if a != b {
                return false;
            }
        }

        keys_match(&self.msg_key, &other.msg_key)
    }
}

/// Тип имени по умолчанию (RIC): ключ без name_type равен ключу с name_type 1.
pub const DEFAULT_NAME_TYPE: u8 = 1;

/// Сравнение ключей: каждое поле должно совпасть и по наличию, и по значению,
/// кроме name_type, у которого отсутствие означает [`DEFAULT_NAME_TYPE`].
pub fn keys_match(a: &MsgKey, b: &MsgKey) -> bool {
    a.name_type.unwrap_or(DEFAULT_NAME_TYPE) == b.name_type.unwrap_or(DEFAULT_NAME_TYPE)
        && a.name == b.name
        && a.service_id == b.service_id
        && a.filter == b.filter
        && a.identifier == b.identifier
        && a.attrib == b.attrib
}

/// Хэш только по имени: домен, QoS и остальные поля ключа в бакет не входят,
/// иначе ответ без QoS или name_type не нашёл бы свой поток.
pub fn msg_key_hash(key: &MsgKey) -> u64 {
    let Some(name) = &key.name else {
        return 0;
    };
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Таблица открытых потоков по атрибутам.
///
/// Нестрогое сравнение QoS не транзитивно, поэтому внутри бакета записи
/// перебираются по порядку вставки.
#[derive(Debug, Default)]
pub struct AttributeTable {
    buckets: HashMap<u64, Vec<(StreamAttributes, StreamId)>>,
    len: usize,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attributes: StreamAttributes, stream_id: StreamId) {
        let hash = msg_key_hash(&attributes.msg_key);
        self.buckets
            .entry(hash)
            .or_default()
            .push((attributes, stream_id));
        self.len += 1;
    }

    /// Удаляет запись потока `stream_id`. Возвращает её атрибуты, если была.
    pub fn remove(&mut self, key: &MsgKey, stream_id: StreamId) -> Option<StreamAttributes> {
        let hash = msg_key_hash(key);
        let bucket = self.buckets.get_mut(&hash)?;
        let pos = bucket.iter().position(|(_, id)| *id == stream_id)?;
        let (attributes, _) = bucket.remove(pos);

        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        self.len -= 1;
        Some(attributes)
    }

    /// Первый подходящий поток (склейка одинаковых запросов).
    pub fn find(&self, attributes: &StreamAttributes) -> Option<StreamId> {
        self.buckets
            .get(&msg_key_hash(&attributes.msg_key))?
            .iter()
            .find(|(a, _)| a.matches(attributes))
            .map(|(_, id)| *id)
    }

    /// Все подходящие потоки (broadcast fan-out).
    pub fn find_all(&self, attributes: &StreamAttributes) -> Vec<StreamId> {
        self.buckets
            .get(&msg_key_hash(&attributes.msg_key))
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|(a, _)| a.matches(attributes))
                    .map(|(_, id)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rwf_core::{Rate, Timeliness};

    fn tri(qos: Option<Qos>) -> StreamAttributes {
        StreamAttributes::new(DomainType::MARKET_PRICE, MsgKey::named(1, "TRI"), qos)
    }

    const DELAYED: Qos = Qos {
        timeliness: Timeliness::Delayed,
        rate: Rate::TimeConflated,
        dynamic: false,
        time_info: 15,
        rate_info: 1000,
    };

    #[test]
    fn qos_omitted_on_either_side_matches() {
        assert!(tri(None).matches(&tri(Some(Qos::REALTIME))));
        assert!(tri(Some(Qos::REALTIME)).matches(&tri(None)));
        assert!(!tri(Some(Qos::REALTIME)).matches(&tri(Some(DELAYED))));
    }

    #[test]
    fn domain_and_key_must_agree() {
        let mut other = tri(None);
        other.domain_type = DomainType::MARKET_BY_ORDER;
        assert!(!tri(None).matches(&other));

        let mut other = tri(None);
        other.msg_key.service_id = Some(2);
        assert!(!tri(None).matches(&other));

        let mut other = tri(None);
        other.msg_key.name_type = Some(2);
        assert!(!tri(None).matches(&other));
    }

    #[test]
    fn missing_name_type_means_ric() {
        let mut ric = tri(None);
        ric.msg_key.name_type = Some(DEFAULT_NAME_TYPE);
        assert!(ric.matches(&tri(None)));
        assert!(tri(None).matches(&ric));
        assert_eq!(msg_key_hash(&ric.msg_key), msg_key_hash(&tri(None).msg_key));

        let mut table = AttributeTable::new();
        table.insert(ric, 7);
        assert_eq!(table.find_all(&tri(None)), vec![7]);
        assert_eq!(table.find(&tri(Some(Qos::REALTIME))), Some(7));
    }

    #[test]
    fn key_without_name_hashes_to_zero() {
        let key = MsgKey {
            service_id: Some(1),
            filter: Some(0x0F),
            ..MsgKey::default()
        };
        assert_eq!(msg_key_hash(&key), 0);
    }

    #[test]
    fn hash_depends_only_on_key() {
        let a = tri(Some(Qos::REALTIME));
        let b = StreamAttributes::new(DomainType::MARKET_BY_PRICE, MsgKey::named(1, "TRI"), None);
        assert_eq!(msg_key_hash(&a.msg_key), msg_key_hash(&b.msg_key));
    }

    #[test]
    fn table_find_and_find_all() {
        let mut table = AttributeTable::new();
        table.insert(tri(Some(Qos::REALTIME)), 3);
        table.insert(tri(Some(DELAYED)), 4);
        table.insert(
            StreamAttributes::new(DomainType::MARKET_PRICE, MsgKey::named(1, "IBM"), None),
            5,
        );

        assert_eq!(table.find(&tri(Some(DELAYED))), Some(4));
        assert_eq!(table.find(&tri(Some(Qos::REALTIME))), Some(3));

        // ответ провайдера без QoS подходит обоим потокам
        assert_eq!(table.find_all(&tri(None)), vec![3, 4]);

        assert_eq!(table.remove(&MsgKey::named(1, "TRI"), 3), Some(tri(Some(Qos::REALTIME))));
        assert_eq!(table.find_all(&tri(None)), vec![4]);
        assert_eq!(table.len(), 2);

        assert_eq!(table.remove(&MsgKey::named(1, "TRI"), 3), None);
    }

    fn qos() -> impl Strategy<Value = Option<Qos>> {
        prop_oneof![Just(None), Just(Some(Qos::REALTIME)), Just(Some(DELAYED))]
    }

    fn attributes() -> impl Strategy<Value = StreamAttributes> {
        (
            prop_oneof![Just(DomainType::MARKET_PRICE), Just(DomainType::MARKET_BY_ORDER)],
            0u16..3,
            prop_oneof![Just("TRI"), Just("IBM")],
            proptest::option::of(0u8..3),
            qos(),
        )
            .prop_map(|(domain, service, name, name_type, qos)| {
                let mut key = MsgKey::named(service, name);
                key.name_type = name_type;
                StreamAttributes::new(domain, key, qos)
            })
    }

    proptest! {
        #[test]
        fn match_is_symmetric(a in attributes(), b in attributes()) {
            prop_assert_eq!(a.matches(&b), b.matches(&a));
        }

        #[test]
        fn match_is_reflexive(a in attributes()) {
            prop_assert!(a.matches(&a));
        }

        #[test]
        fn matching_attributes_share_a_bucket(a in attributes(), b in attributes()) {
            if a.matches(&b) {
                prop_assert_eq!(msg_key_hash(&a.msg_key), msg_key_hash(&b.msg_key));
            }
        }
    }
}
