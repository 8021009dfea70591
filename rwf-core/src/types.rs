use std::fmt;

use serde::{Deserialize, Serialize};

/// Идентификатор потока. Положительные выдаёт consumer, отрицательные — provider.
pub type StreamId = i32;

/// Номер последовательности multicast/broadcast сообщений (с переполнением).
pub type SeqNum = u32;

/// Тег домена сообщения (MarketPrice, Login, Directory, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainType(pub u8);

impl DomainType {
    /// Логин
    pub const LOGIN: DomainType = DomainType(1);
    /// Source Directory
    pub const SOURCE: DomainType = DomainType(4);
    /// Словарь
    pub const DICTIONARY: DomainType = DomainType(5);
    /// Котировки
    pub const MARKET_PRICE: DomainType = DomainType(6);
    /// Стакан по заявкам
    pub const MARKET_BY_ORDER: DomainType = DomainType(7);
    /// Стакан по ценам
    pub const MARKET_BY_PRICE: DomainType = DomainType(8);
    /// Кривая доходности
    pub const YIELD_CURVE: DomainType = DomainType(22);

    /// Административный домен (login/directory) обслуживается отдельно от item-потоков.
    pub fn is_admin(self) -> bool {
        self == Self::LOGIN || self == Self::SOURCE
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LOGIN => f.write_str("Login"),
            Self::SOURCE => f.write_str("Source"),
            Self::DICTIONARY => f.write_str("Dictionary"),
            Self::MARKET_PRICE => f.write_str("MarketPrice"),
            Self::MARKET_BY_ORDER => f.write_str("MarketByOrder"),
            Self::MARKET_BY_PRICE => f.write_str("MarketByPrice"),
            Self::YIELD_CURVE => f.write_str("YieldCurve"),
            DomainType(other) => write!(f, "Domain({other})"),
        }
    }
}

/// Своевременность данных
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeliness {
    /// Реальное время
    Realtime,
    /// Задержка неизвестна
    DelayedUnknown,
    /// Задержка в секундах (`time_info`)
    Delayed,
}

/// Частота данных
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rate {
    /// Каждое изменение
    TickByTick,
    /// Склейка по времени неизвестна
    JitConflated,
    /// Склейка с интервалом (`rate_info`)
    TimeConflated,
}

/// Quality of Service потока
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qos {
    pub timeliness: Timeliness,
    pub rate: Rate,
    pub dynamic: bool,
    pub time_info: u16,
    pub rate_info: u16,
}

impl Qos {
    /// Realtime / tick-by-tick: QoS по умолчанию для большинства сервисов.
    pub const REALTIME: Qos = Qos {
        timeliness: Timeliness::Realtime,
        rate: Rate::TickByTick,
        dynamic: false,
        time_info: 0,
        rate_info: 0,
    };
}

/// Состояние потока
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Open,
    NonStreaming,
    ClosedRecover,
    Closed,
    Redirected,
}

/// Состояние данных
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataState {
    NoChange,
    Ok,
    Suspect,
}

/// Код статуса
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    None,
    NotFound,
    Timeout,
    NotEntitled,
    UsageError,
    GapDetected,
    ServiceDown,
}

/// Состояние потока/данных, которое провайдер (или watchlist) сообщает приложению.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub code: StatusCode,
    pub text: String,
}

impl State {
    pub fn new(
        stream_state: StreamState,
        data_state: DataState,
        code: StatusCode,
        text: impl Into<String>,
    ) -> Self {
        Self {
            stream_state,
            data_state,
            code,
            text: text.into(),
        }
    }

    /// OPEN / OK без текста
    pub fn open_ok() -> Self {
        Self::new(StreamState::Open, DataState::Ok, StatusCode::None, "")
    }

    pub fn is_open(&self) -> bool {
        self.stream_state == StreamState::Open
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{:?} \"{}\"",
            self.stream_state, self.data_state, self.code, self.text
        )
    }
}

/// Причина отрицательного подтверждения post-сообщения
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NakCode {
    None,
    AccessDenied,
    DeniedBySource,
    SourceDown,
    NoResponse,
    InvalidContent,
}

/// Ключ сообщения. Отсутствующие поля не участвуют в сравнении только если
/// отсутствуют с обеих сторон.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgKey {
    pub service_id: Option<u16>,
    pub name: Option<String>,
    pub name_type: Option<u8>,
    pub filter: Option<u32>,
    pub identifier: Option<i32>,
    pub attrib: Option<Vec<u8>>,
}

impl MsgKey {
    /// Ключ "сервис + имя", самый частый случай.
    pub fn named(service_id: u16, name: impl Into<String>) -> Self {
        Self {
            service_id: Some(service_id),
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

impl fmt::Display for MsgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.service_id, &self.name) {
            (Some(id), Some(name)) => write!(f, "{id}/{name}"),
            (None, Some(name)) => write!(f, "?/{name}"),
            (Some(id), None) => write!(f, "{id}/?"),
            (None, None) => f.write_str("<empty key>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_domains() {
        assert!(DomainType::LOGIN.is_admin());
        assert!(DomainType::SOURCE.is_admin());
        assert!(!DomainType::MARKET_PRICE.is_admin());
        assert!(!DomainType::DICTIONARY.is_admin());
    }

    #[test]
    fn msg_key_equality_is_presence_sensitive() {
        let a = MsgKey::named(1, "TRI");
        let mut b = MsgKey::named(1, "TRI");
        assert_eq!(a, b);

        b.name_type = Some(1);
        assert_ne!(a, b);
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(MsgKey::named(1, "TRI").to_string(), "1/TRI");
        assert_eq!(DomainType::MARKET_PRICE.to_string(), "MarketPrice");
        assert_eq!(DomainType(200).to_string(), "Domain(200)");
    }
}
