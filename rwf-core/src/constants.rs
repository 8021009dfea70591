use std::time::Duration;

use crate::types::StreamId;

/// время, после которого канал без входящего трафика считается "мёртвым"
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Интервал ping (треть таймаута, как принято для RWF-каналов)
pub const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Stream ID логин-потока watchlist'а
pub const LOGIN_STREAM_ID: StreamId = 1;

/// Stream ID directory-потока watchlist'а
pub const DIRECTORY_STREAM_ID: StreamId = 2;

/// Минимальный Stream ID для item-потоков (1 и 2 зарезервированы)
pub const MIN_STREAM_ID: StreamId = 3;

/// Первый Stream ID для потоков со стороны провайдера
pub const MIN_PROVIDER_STREAM_ID: StreamId = -1;

/// Таймаут ответа на запрос, мс
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Таймаут подтверждения post-сообщения, мс
pub const DEFAULT_POST_ACK_TIMEOUT_MS: u64 = 15_000;

/// Таймаут ожидания пропущенных multicast-сообщений, мс
pub const DEFAULT_GAP_TIMEOUT_MS: u64 = 5_000;

/// Сколько fault-tolerant группа может молчать, мс (как `PING_TIMEOUT`)
pub const DEFAULT_FT_GROUP_TIMEOUT_MS: u64 = 60_000;

/// Максимум буферизованных broadcast-сообщений на поток
pub const DEFAULT_MAX_BUFFERED_BROADCAST_MSGS: usize = 500;

/// Размер пула item-запросов
pub const DEFAULT_REQUEST_POOL_COUNT: usize = 10_000;

/// Размер пула потоков
pub const DEFAULT_STREAM_POOL_COUNT: usize = 10_000;

/// Максимум post-сообщений, ожидающих подтверждения
pub const DEFAULT_MAX_OUTSTANDING_POSTS: usize = 100_000;
