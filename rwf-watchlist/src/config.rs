use serde::{Deserialize, Serialize};

use rwf_core::constants::{
    DEFAULT_FT_GROUP_TIMEOUT_MS, DEFAULT_GAP_TIMEOUT_MS, DEFAULT_MAX_BUFFERED_BROADCAST_MSGS, DEFAULT_MAX_OUTSTANDING_POSTS,
    DEFAULT_POST_ACK_TIMEOUT_MS, DEFAULT_REQUEST_POOL_COUNT, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_STREAM_POOL_COUNT,
};

use crate::error::ConfigError;

/// Настройки одного watchlist'а (одного канала).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchlistConfig {
    /// Сколько ждать refresh на отправленный запрос, мс
    pub request_timeout_ms: u64,
    /// Сколько ждать AckMsg на post с флагом ack, мс
    pub post_ack_timeout_ms: u64,
    /// Сколько ждать пропущенные multicast-сообщения, мс
    pub gap_timeout_ms: u64,
    /// Сколько fault-tolerant группа может молчать, прежде чем её потоки
    /// будут переоткрыты, мс
    pub ft_group_timeout_ms: u64,
    pub max_buffered_broadcast_msgs: usize,
    /// Не держать у сервиса больше запросов без ответа, чем его OpenWindow
    pub obey_open_window: bool,
    pub request_pool_count: usize,
    pub stream_pool_count: usize,
    pub max_outstanding_posts: usize,
    /// Закрывать поток при пропуске в broadcast-последовательности
    pub gap_recovery: bool,
    /// Переоткрывать потоки, закрытые провайдером как ClosedRecover
    pub single_open: bool,
    /// Пропускать OPEN/SUSPECT refresh приложению вместо переоткрытия
    pub allow_suspect_data: bool,
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            post_ack_timeout_ms: DEFAULT_POST_ACK_TIMEOUT_MS,
            gap_timeout_ms: DEFAULT_GAP_TIMEOUT_MS,
            ft_group_timeout_ms: DEFAULT_FT_GROUP_TIMEOUT_MS,
            max_buffered_broadcast_msgs: DEFAULT_MAX_BUFFERED_BROADCAST_MSGS,
            obey_open_window: true,
            request_pool_count: DEFAULT_REQUEST_POOL_COUNT,
            stream_pool_count: DEFAULT_STREAM_POOL_COUNT,
            max_outstanding_posts: DEFAULT_MAX_OUTSTANDING_POSTS,
            gap_recovery: true,
            single_open: true,
            allow_suspect_data: true,
        }
    }
}

impl WatchlistConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.request_timeout_ms == 0, "request_timeout_ms"),
            (self.post_ack_timeout_ms == 0, "post_ack_timeout_ms"),
            (self.gap_timeout_ms == 0, "gap_timeout_ms"),
            (self.ft_group_timeout_ms == 0, "ft_group_timeout_ms"),
            (
                self.max_buffered_broadcast_msgs == 0,
                "max_buffered_broadcast_msgs",
            ),
            (self.request_pool_count == 0, "request_pool_count"),
            (self.stream_pool_count == 0, "stream_pool_count"),
            (self.max_outstanding_posts == 0, "max_outstanding_posts"),
        ];

        match checks.into_iter().find(|(bad, _)| *bad) {
            Some((_, name)) => Err(ConfigError::Zero(name)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = WatchlistConfig::default();
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.request_timeout_ms, 15_000);
        assert_eq!(cfg.max_buffered_broadcast_msgs, 500);
    }

    #[test]
    fn zero_values_are_rejected() {
        let cfg = WatchlistConfig {
            post_ack_timeout_ms: 0,
            ..WatchlistConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero("post_ack_timeout_ms"))
        );
        assert_eq!(
            ConfigError::Zero("post_ack_timeout_ms").to_string(),
            "post_ack_timeout_ms must be greater than zero"
        );
    }

    #[test]
    fn serde_fills_missing_fields_with_defaults() {
        let cfg: WatchlistConfig =
            serde_json::from_str(r#"{ "gap_recovery": false, "request_pool_count": 7 }"#)
                .expect("partial config should parse");

        assert!(!cfg.gap_recovery);
        assert_eq!(cfg.request_pool_count, 7);
        assert_eq!(cfg.stream_pool_count, WatchlistConfig::default().stream_pool_count);
        assert!(cfg.single_open);
    }
}
