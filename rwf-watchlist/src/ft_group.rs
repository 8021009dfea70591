//! Fault-tolerant группы: узлы провайдера, шлющие broadcast от имени группы.
//!
//! Пока от группы идут сообщения или ping, её потоки живы. Группа, которая
//! замолчала дольше таймаута, считается потерянной вместе с потоками.

use std::collections::BTreeMap;

use log::debug;
use rwf_core::StreamId;

#[derive(Debug)]
pub(crate) struct FtGroup {
    pub expire_time: u64,
    pub streams: Vec<StreamId>,
}

#[derive(Debug)]
pub(crate) struct FtGroupTable {
    groups: BTreeMap<u8, FtGroup>,
    timeout_ms: u64,
}

impl FtGroupTable {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            groups: BTreeMap::new(),
            timeout_ms,
        }
    }

    /// Поток входит в группу. Новая группа сразу получает срок.
    pub fn add_stream(&mut self, group_id: u8, stream_id: StreamId, now: u64) {
        let timeout_ms = self.timeout_ms;
        let group = self.groups.entry(group_id).or_insert_with(|| {
            debug!("ft group {group_id} created");
            FtGroup {
                expire_time: now + timeout_ms,
                streams: Vec::new(),
            }
        });
        if !group.streams.contains(&stream_id) {
            group.streams.push(stream_id);
        }
    }

    /// Группа подала признак жизни. Новый срок, если группа нам известна.
    pub fn refresh(&mut self, group_id: u8, now: u64) -> Option<u64> {
        let group = self.groups.get_mut(&group_id)?;
        group.expire_time = now + self.timeout_ms;
        Some(group.expire_time)
    }

    /// Пустая группа удаляется.
    pub fn remove_stream(&mut self, group_id: u8, stream_id: StreamId) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        group.streams.retain(|id| *id != stream_id);
        if group.streams.is_empty() {
            debug!("ft group {group_id} removed");
            self.groups.remove(&group_id);
        }
    }

    pub fn next_expire_time(&self) -> Option<u64> {
        self.groups.values().map(|g| g.expire_time).min()
    }

    /// Снимает группы со сроком `<= now` и отдаёт их потоки.
    pub fn take_expired(&mut self, now: u64) -> Vec<(u8, Vec<StreamId>)> {
        let expired: Vec<u8> = self
            .groups
            .iter()
            .filter(|(_, g)| g.expire_time <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.groups.remove(&id).map(|g| (id, g.streams)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
