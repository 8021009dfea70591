use rwf_core::StreamId;
use rwf_core::constants::{MIN_PROVIDER_STREAM_ID, MIN_STREAM_ID};

/// Выдаёт wire stream id для потоков watchlist'а.
///
/// Положительные id начинаются с 3 (1 и 2 заняты login/directory), отрицательные
/// — с -1. Id, который ещё числится открытым, пропускается. Если свободных id нет
/// совсем, поиск не завершится — пулы потоков заведомо меньше диапазона.
#[derive(Debug, Clone)]
pub struct StreamIdAllocator {
    next_id: StreamId,
    next_provider_id: StreamId,
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: MIN_STREAM_ID,
            next_provider_id: MIN_PROVIDER_STREAM_ID,
        }
    }

    pub fn take_stream_id(&mut self, is_open: impl Fn(StreamId) -> bool) -> StreamId {
        loop {
            let id = self.next_id;
            self.next_id = if id == StreamId::MAX {
                MIN_STREAM_ID
            } else {
                id + 1
            };

            if !is_open(id) {
                return id;
            }
        }
    }

    pub fn take_provider_stream_id(&mut self, is_open: impl Fn(StreamId) -> bool) -> StreamId {
        loop {
            let id = self.next_provider_id;
            self.next_provider_id = if id == StreamId::MIN {
                MIN_PROVIDER_STREAM_ID
            } else {
                id - 1
            };

            if !is_open(id) {
                return id;
            }
        }
    }
}
