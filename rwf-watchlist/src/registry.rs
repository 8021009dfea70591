//! Реестр потоков и очереди "ждёт отправки запроса" / "ждёт ответа".

use std::collections::{HashMap, VecDeque};
use std::fmt;

use log::debug;
use rwf_core::{DomainType, StreamId};

use crate::error::WatchlistError;

/// Битовая маска состояния запроса потока.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestState(u8);

impl RequestState {
    pub const NONE: RequestState = RequestState(0);
    pub const PENDING_REQUEST: RequestState = RequestState(0x1);
    pub const PENDING_RESPONSE: RequestState = RequestState(0x2);

    pub fn contains(self, other: RequestState) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: RequestState) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: RequestState) {
        self.0 &= !other.0;
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            self.contains(Self::PENDING_REQUEST),
            self.contains(Self::PENDING_RESPONSE),
        ) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("PENDING_REQUEST"),
            (false, true) => f.write_str("PENDING_RESPONSE"),
            (true, true) => f.write_str("PENDING_REQUEST|PENDING_RESPONSE"),
        }
    }
}

/// Общая часть любого потока watchlist'а (login, directory, item, временный).
#[derive(Debug, Clone)]
pub struct StreamBase {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    request_state: RequestState,
    /// Вместо запроса при следующем dispatch уйдёт CloseMsg
    pub is_closing: bool,
    /// Поток заведён только ради отправки CloseMsg
    pub is_temporary: bool,
    request_expire_time: Option<u64>,
}

impl StreamBase {
    fn new(stream_id: StreamId, domain_type: DomainType) -> Self {
        Self {
            stream_id,
            domain_type,
            request_state: RequestState::NONE,
            is_closing: false,
            is_temporary: false,
            request_expire_time: None,
        }
    }

    pub fn request_state(&self) -> RequestState {
        self.request_state
    }

    pub fn request_expire_time(&self) -> Option<u64> {
        self.request_expire_time
    }
}

#[derive(Debug)]
pub struct RequestRegistry {
    streams: HashMap<StreamId, StreamBase>,
    capacity: usize,
    request_timeout_ms: u64,
    pending_request: VecDeque<StreamId>,
    /// Упорядочена по времени истечения: таймаут у всех одинаковый
    pending_response: VecDeque<StreamId>,
}

impl RequestRegistry {
    pub fn new(capacity: usize, request_timeout_ms: u64) -> Self {
        Self {
            streams: HashMap::with_capacity(capacity),
            capacity,
            request_timeout_ms,
            pending_request: VecDeque::new(),
            pending_response: VecDeque::new(),
        }
    }

    /// Регистрирует поток. Повторная регистрация id: ошибка вызывающего.
    pub fn add(&mut self, stream_id: StreamId, domain_type: DomainType) -> Result<(), WatchlistError> {
        if self.streams.contains_key(&stream_id) {
            debug_assert!(false, "stream {stream_id} registered twice");
            return Err(WatchlistError::Invariant(format!(
                "stream {stream_id} is already registered"
            )));
        }

        if self.live_count() >= self.capacity {
            return Err(WatchlistError::PoolExhausted {
                what: "stream",
                capacity: self.capacity,
            });
        }

        self.streams
            .insert(stream_id, StreamBase::new(stream_id, domain_type));
        Ok(())
    }

    /// Потоки, занимающие место в ёмкости. Закрывающиеся ждут только
    /// отправки CloseMsg и место уже освободили.
    fn live_count(&self) -> usize {
        self.streams
            .values()
            .filter(|b| !b.is_closing && !b.is_temporary)
            .count()
    }

    /// Временный поток для CloseMsg на неизвестный stream id. В ёмкость не
    /// входит и сразу ставится в очередь на отправку.
    pub fn add_temporary(&mut self, stream_id: StreamId, domain_type: DomainType) -> bool {
        if self.streams.contains_key(&stream_id) {
            return false;
        }

        let mut base = StreamBase::new(stream_id, domain_type);
        base.is_closing = true;
        base.is_temporary = true;
        self.streams.insert(stream_id, base);
        self.set_pending_request(stream_id);
        true
    }

    /// Убирает поток из обеих очередей, затем из реестра.
    pub fn remove(&mut self, stream_id: StreamId) -> Option<StreamBase> {
        self.unset_from_all_pending_lists(stream_id);
        self.streams.remove(&stream_id)
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&StreamBase> {
        self.streams.get(&stream_id)
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Поток будет закрыт при следующем dispatch.
    pub fn mark_closing(&mut self, stream_id: StreamId) -> bool {
        let Some(base) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        base.is_closing = true;
        self.unset_pending_response(stream_id);
        self.set_pending_request(stream_id)
    }

    pub fn set_pending_request(&mut self, stream_id: StreamId) -> bool {
        let Some(base) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if base.request_state.contains(RequestState::PENDING_REQUEST) {
            return false;
        }
        base.request_state.insert(RequestState::PENDING_REQUEST);
        self.pending_request.push_back(stream_id);
        true
    }

    pub fn unset_pending_request(&mut self, stream_id: StreamId) -> bool {
        let Some(base) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if !base.request_state.contains(RequestState::PENDING_REQUEST) {
            return false;
        }
        base.request_state.remove(RequestState::PENDING_REQUEST);
        remove_from_queue(&mut self.pending_request, stream_id);
        true
    }

    /// Ставит таймер ответа `now + request_timeout`. Возвращает `true`, если
    /// поток встал в очередь (значит, watchlist'у нужен таймер).
    pub fn set_pending_response(&mut self, stream_id: StreamId, now: u64) -> bool {
        let Some(base) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if base.request_state.contains(RequestState::PENDING_RESPONSE) {
            return false;
        }
        base.request_state.insert(RequestState::PENDING_RESPONSE);
        base.request_expire_time = Some(now + self.request_timeout_ms);
        self.pending_response.push_back(stream_id);
        true
    }

    pub fn unset_pending_response(&mut self, stream_id: StreamId) -> bool {
        let Some(base) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if !base.request_state.contains(RequestState::PENDING_RESPONSE) {
            return false;
        }
        base.request_state.remove(RequestState::PENDING_RESPONSE);
        base.request_expire_time = None;
        remove_from_queue(&mut self.pending_response, stream_id);
        true
    }

    /// Перезапуск таймера: поток уходит в конец очереди ответов.
    pub fn reset_pending_response(&mut self, stream_id: StreamId, now: u64) -> bool {
        self.unset_pending_response(stream_id);
        self.set_pending_response(stream_id, now)
    }

    pub fn unset_from_all_pending_lists(&mut self, stream_id: StreamId) {
        self.unset_pending_request(stream_id);
        self.unset_pending_response(stream_id);

        debug_assert!(
            self.streams
                .get(&stream_id)
                .is_none_or(|b| b.request_state == RequestState::NONE)
        );
    }

    /// Следующий поток, которому нужно отправить запрос (или CloseMsg).
    pub fn pop_pending_request(&mut self) -> Option<StreamId> {
        while let Some(stream_id) = self.pending_request.pop_front() {
            if let Some(base) = self.streams.get_mut(&stream_id) {
                base.request_state.remove(RequestState::PENDING_REQUEST);
                return Some(stream_id);
            }
        }
        None
    }

    /// Потоки, чей ответ просрочен к `now`. Они выходят из очереди ответов,
    /// но остаются в реестре: решение о них принимает watchlist.
    pub fn take_expired(&mut self, now: u64) -> Vec<StreamId> {
        let mut expired = Vec::new();

        while let Some(&stream_id) = self.pending_response.front() {
            let Some(base) = self.streams.get_mut(&stream_id) else {
                self.pending_response.pop_front();
                continue;
            };

            match base.request_expire_time {
                Some(t) if t > now => break,
                _ => {}
            }

            base.request_state.remove(RequestState::PENDING_RESPONSE);
            base.request_expire_time = None;
            self.pending_response.pop_front();
            debug!("request on stream {stream_id} timed out");
            expired.push(stream_id);
        }

        expired
    }

    pub fn next_expire_time(&self) -> Option<u64> {
        self.pending_response
            .front()
            .and_then(|id| self.streams.get(id))
            .and_then(|b| b.request_expire_time)
    }

    pub fn is_pending_request(&self, stream_id: StreamId) -> bool {
        self.pending_request.contains(&stream_id)
    }

    pub fn is_pending_response(&self, stream_id: StreamId) -> bool {
        self.pending_response.contains(&stream_id)
    }

    pub fn pending_request_len(&self) -> usize {
        self.pending_request.len()
    }

    pub fn pending_response_len(&self) -> usize {
        self.pending_response.len()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
        self.pending_request.clear();
        self.pending_response.clear();
    }
}

fn remove_from_queue(queue: &mut VecDeque<StreamId>, stream_id: StreamId) {
    if let Some(pos) = queue.iter().position(|id| *id == stream_id) {
        queue.remove(pos);
    }
}
