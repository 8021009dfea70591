use std::time::Duration;

use rwf_watchlist::WatchlistConfig;

pub use rwf_core::PING_TIMEOUT;

/// Сколько ошибок записи подряд терпим, прежде чем считать канал упавшим
pub const BACK_TO_BACK_WRITE_ERR_LIMIT: usize = 20;

/// Максимальное ожидание одного шага в [`crate::Reactor::run`]
pub const REACTOR_TICK: Duration = Duration::from_millis(10);

pub type ChannelId = u64;

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Канал без входящего трафика дольше этого времени считается "мёртвым"
    pub ping_timeout: Duration,
    pub write_error_limit: usize,
    pub tick: Duration,
    /// Настройки watchlist'а для каждого нового канала
    pub watchlist: WatchlistConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            ping_timeout: PING_TIMEOUT,
            write_error_limit: BACK_TO_BACK_WRITE_ERR_LIMIT,
            tick: REACTOR_TICK,
            watchlist: WatchlistConfig::default(),
        }
    }
}

impl ReactorConfig {
    /// Интервал отправки ping: треть таймаута.
    pub fn ping_interval(&self) -> Duration {
        self.ping_timeout / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ping_interval_is_third_of_timeout() {
        let config = ReactorConfig::default();
        assert_eq!(config.ping_interval(), rwf_core::PING_INTERVAL);
        assert_eq!(config.write_error_limit, BACK_TO_BACK_WRITE_ERR_LIMIT);
    }
}
