//! Post-сообщения, ожидающие AckMsg: поиск дубликатов и таймауты.

use std::collections::{HashMap, VecDeque};

use log::debug;
use rwf_core::{DomainType, PostMsg, SeqNum, StreamId};

use crate::error::PostError;
use crate::pool::{Handle, Pool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    /// Stream id приложения, которому придёт подтверждение
    pub owner: StreamId,
    /// Wire stream id, на который ушёл post
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    pub post_id: u32,
    pub seq_num: Option<SeqNum>,
    pub complete: bool,
    pub service_id: Option<u16>,
    pub name: Option<String>,
    pub expire_time: u64,
}

/// Ключ индекса. Номер последовательности входит только у незавершённых
/// частей: завершённый post ищется по одному Post ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PostKey {
    stream_id: StreamId,
    post_id: u32,
    complete: bool,
    seq_num: Option<SeqNum>,
}

impl PostKey {
    fn completed(stream_id: StreamId, post_id: u32) -> Self {
        Self {
            stream_id,
            post_id,
            complete: true,
            seq_num: None,
        }
    }

    fn part(stream_id: StreamId, post_id: u32, seq_num: SeqNum) -> Self {
        Self {
            stream_id,
            post_id,
            complete: false,
            seq_num: Some(seq_num),
        }
    }

    fn of(record: &PostRecord) -> Self {
        match (record.complete, record.seq_num) {
            (false, Some(seq)) => Self::part(record.stream_id, record.post_id, seq),
            _ => Self::completed(record.stream_id, record.post_id),
        }
    }
}

#[derive(Debug)]
pub struct PostAckTable {
    pool: Pool<PostRecord>,
    index: HashMap<PostKey, Handle>,
    /// Порядок вставки совпадает с порядком истечения
    timeout_queue: VecDeque<Handle>,
    ack_timeout_ms: u64,
}

impl PostAckTable {
    pub fn new(capacity: usize, ack_timeout_ms: u64) -> Self {
        Self {
            pool: Pool::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            timeout_queue: VecDeque::with_capacity(capacity),
            ack_timeout_ms,
        }
    }

    /// Запоминает post с запросом подтверждения.
    pub fn add_record(
        &mut self,
        owner: StreamId,
        stream_id: StreamId,
        post: &PostMsg,
        now: u64,
    ) -> Result<Handle, PostError> {
        let Some(post_id) = post.post_id else {
            return Err(PostError::MissingPostId);
        };

        if !post.complete && post.seq_num.is_none() {
            return Err(PostError::MissingSeqNum);
        }

        if self
            .index
            .contains_key(&PostKey::completed(stream_id, post_id))
        {
            return Err(PostError::Duplicate { post_id });
        }

        let key = match (post.complete, post.seq_num) {
            (false, Some(seq_num)) => {
                let key = PostKey::part(stream_id, post_id, seq_num);
                if self.index.contains_key(&key) {
                    return Err(PostError::DuplicatePart { post_id, seq_num });
                }
                key
            }
            _ => PostKey::completed(stream_id, post_id),
        };

        let record = PostRecord {
            owner,
            stream_id,
            domain_type: post.domain_type,
            post_id,
            seq_num: post.seq_num,
            complete: post.complete,
            service_id: post.key.as_ref().and_then(|k| k.service_id),
            name: post.key.as_ref().and_then(|k| k.name.clone()),
            expire_time: now + self.ack_timeout_ms,
        };

        let handle = self
            .pool
            .insert(record)
            .map_err(|_| PostError::TooManyPosts)?;
        self.index.insert(key, handle);
        self.timeout_queue.push_back(handle);
        Ok(handle)
    }

    /// Запись, которую подтверждает `ack_id` (и, если есть, `seq_num`) на потоке.
    pub fn find_record(
        &self,
        stream_id: StreamId,
        ack_id: u32,
        seq_num: Option<SeqNum>,
    ) -> Option<Handle> {
        if let Some(&handle) = self.index.get(&PostKey::completed(stream_id, ack_id)) {
            let record_seq = self.pool.get(handle).and_then(|r| r.seq_num);
            match (seq_num, record_seq) {
                (Some(a), Some(b)) if a != b => {}
                _ => return Some(handle),
            }
        }

        let seq_num = seq_num?;
        self.index
            .get(&PostKey::part(stream_id, ack_id, seq_num))
            .copied()
    }

    pub fn get(&self, handle: Handle) -> Option<&PostRecord> {
        self.pool.get(handle)
    }

    pub fn remove_record(&mut self, handle: Handle) -> Option<PostRecord> {
        let record = self.pool.remove(handle)?;
        self.index.remove(&PostKey::of(&record));
        if let Some(pos) = self.timeout_queue.iter().position(|h| *h == handle) {
            self.timeout_queue.remove(pos);
        }
        Some(record)
    }

    /// Просроченные к `now` записи, уже удалённые из таблицы.
    pub fn take_expired(&mut self, now: u64) -> Vec<PostRecord> {
        let mut expired = Vec::new();

        while let Some(&handle) = self.timeout_queue.front() {
            match self.pool.get(handle).map(|r| r.expire_time) {
                Some(t) if t > now => break,
                Some(_) => {
                    if let Some(record) = self.remove_record(handle) {
                        debug!(
                            "post {} on stream {} was not acknowledged",
                            record.post_id, record.stream_id
                        );
                        expired.push(record);
                    }
                }
                None => {
                    self.timeout_queue.pop_front();
                }
            }
        }

        expired
    }

    /// Выбрасывает все post'ы запроса, который закрывается.
    pub fn remove_for_owner(&mut self, owner: StreamId) -> usize {
        let handles: Vec<Handle> = self
            .pool
            .iter()
            .filter(|(_, r)| r.owner == owner)
            .map(|(h, _)| h)
            .collect();

        for handle in &handles {
            self.remove_record(*handle);
        }
        handles.len()
    }

    pub fn next_expire_time(&self) -> Option<u64> {
        self.timeout_queue
            .front()
            .and_then(|h| self.pool.get(*h))
            .map(|r| r.expire_time)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }

    pub fn clear(&mut self) {
        self.pool.clear();
        self.index.clear();
        self.timeout_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(post_id: u32, seq_num: Option<SeqNum>, complete: bool) -> PostMsg {
        let mut p = PostMsg::new(1, DomainType::MARKET_PRICE);
        p.ack = true;
        p.post_id = Some(post_id);
        p.seq_num = seq_num;
        p.complete = complete;
        p
    }

    #[test]
    fn completed_post_blocks_same_id() {
        let mut table = PostAckTable::new(8, 1_000);
        table.add_record(10, 1, &post(100, None, true), 0).unwrap();

        assert_eq!(
            table.add_record(10, 1, &post(100, Some(3), true), 0),
            Err(PostError::Duplicate { post_id: 100 })
        );
        assert_eq!(
            table.add_record(10, 1, &post(100, Some(4), false), 0),
            Err(PostError::Duplicate { post_id: 100 })
        );

        // другой поток, не дубликат
        table.add_record(11, 2, &post(100, None, true), 0).unwrap();
    }

    #[test]
    fn incomplete_parts_are_keyed_by_seq() {
        let mut table = PostAckTable::new(8, 1_000);
        table.add_record(10, 1, &post(100, Some(5), false), 0).unwrap();

        assert_eq!(
            table.add_record(10, 1, &post(100, Some(5), false), 0),
            Err(PostError::DuplicatePart {
                post_id: 100,
                seq_num: 5
            })
        );
        table.add_record(10, 1, &post(100, Some(6), false), 0).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn invalid_posts_are_rejected() {
        let mut table = PostAckTable::new(8, 1_000);

        let mut no_id = post(1, None, true);
        no_id.post_id = None;
        assert_eq!(
            table.add_record(10, 1, &no_id, 0),
            Err(PostError::MissingPostId)
        );

        assert_eq!(
            table.add_record(10, 1, &post(1, None, false), 0),
            Err(PostError::MissingSeqNum)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn pool_exhaustion() {
        let n = 3;
        let mut table = PostAckTable::new(n, 1_000);
        for id in 0..n as u32 {
            table.add_record(10, 1, &post(id, None, true), 0).unwrap();
        }

        assert_eq!(
            table.add_record(10, 1, &post(99, None, true), 0),
            Err(PostError::TooManyPosts)
        );
        assert_eq!(table.len(), n);
        assert_eq!(table.free_count(), 0);
    }

    #[test]
    fn find_prefers_completed_record() {
        let mut table = PostAckTable::new(8, 1_000);
        let part = table.add_record(10, 1, &post(7, Some(1), false), 0).unwrap();
        let done = table.add_record(10, 1, &post(7, Some(2), true), 0).unwrap();

        assert_eq!(table.find_record(1, 7, None), Some(done));
        assert_eq!(table.find_record(1, 7, Some(2)), Some(done));
        // seq не совпал с завершённым -> ищем часть
        assert_eq!(table.find_record(1, 7, Some(1)), Some(part));
        assert_eq!(table.find_record(1, 7, Some(9)), None);
        assert_eq!(table.find_record(2, 7, None), None);
    }

    #[test]
    fn remove_frees_slot_and_index() {
        let mut table = PostAckTable::new(1, 1_000);
        let h = table.add_record(10, 1, &post(7, None, true), 0).unwrap();

        let record = table.remove_record(h).unwrap();
        assert_eq!(record.post_id, 7);
        assert_eq!(table.find_record(1, 7, None), None);
        assert_eq!(table.next_expire_time(), None);

        // слот снова свободен, дубликата больше нет
        table.add_record(10, 1, &post(7, None, true), 5).unwrap();
    }

    #[test]
    fn timeout_sweep_in_insertion_order() {
        let mut table = PostAckTable::new(8, 1_000);
        table.add_record(10, 1, &post(1, None, true), 0).unwrap();
        table.add_record(10, 1, &post(2, None, true), 100).unwrap();
        assert_eq!(table.next_expire_time(), Some(1_000));

        assert!(table.take_expired(999).is_empty());

        let expired = table.take_expired(1_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].post_id, 1);
        assert_eq!(table.next_expire_time(), Some(1_100));

        let expired = table.take_expired(5_000);
        assert_eq!(expired[0].post_id, 2);
        assert!(table.is_empty());
    }

    #[test]
    fn remove_for_owner_drops_only_its_posts() {
        let mut table = PostAckTable::new(8, 1_000);
        table.add_record(10, 1, &post(1, None, true), 0).unwrap();
        table.add_record(10, 1, &post(2, Some(1), false), 0).unwrap();
        table.add_record(11, 2, &post(1, None, true), 0).unwrap();

        assert_eq!(table.remove_for_owner(10), 2);
        assert_eq!(table.len(), 1);
        assert!(table.find_record(2, 1, None).is_some());
    }
}
