use rwf_core::{SeqNum, StreamId, WireError};
use thiserror::Error;

/// Причина, по которой post-сообщение не принято в таблицу подтверждений.
///
/// Тексты ошибок уходят приложению как есть.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("Post message requests acknowledgement but has no Post ID.")]
    MissingPostId,

    #[error(
        "Post message requests acknowledgement and is not complete, but has no sequence number."
    )]
    MissingSeqNum,

    #[error("Post contains duplicate information (Post exists with ID {post_id})")]
    Duplicate { post_id: u32 },

    #[error("Post contains duplicate information (Post exists with ID {post_id}, SeqNum {seq_num})")]
    DuplicatePart { post_id: u32, seq_num: SeqNum },

    #[error("Too many posts awaiting acknowledgement.")]
    TooManyPosts,
}

/// Некорректная конфигурация watchlist'а
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Error)]
pub enum WatchlistError {
    #[error(transparent)]
    Post(#[from] PostError),

    #[error("{what} pool exhausted (capacity {capacity})")]
    PoolExhausted { what: &'static str, capacity: usize },

    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} is not open")]
    StreamNotOpen(StreamId),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("reissue on stream {0} changes domain or key")]
    KeyMismatchOnReissue(StreamId),

    #[error("stream {0} is already in use")]
    StreamInUse(StreamId),

    #[error("request on stream {0} names no service")]
    MissingService(StreamId),

    /// Нарушен контракт вызывающей стороны (в debug-сборке это assert)
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_error_texts() {
        assert_eq!(
            PostError::Duplicate { post_id: 100 }.to_string(),
            "Post contains duplicate information (Post exists with ID 100)"
        );
        assert_eq!(
            PostError::DuplicatePart {
                post_id: 100,
                seq_num: 5
            }
            .to_string(),
            "Post contains duplicate information (Post exists with ID 100, SeqNum 5)"
        );
        assert_eq!(
            PostError::TooManyPosts.to_string(),
            "Too many posts awaiting acknowledgement."
        );
    }

    #[test]
    fn post_error_converts_transparently() {
        let err: WatchlistError = PostError::MissingPostId.into();
        assert_eq!(
            err.to_string(),
            "Post message requests acknowledgement but has no Post ID."
        );
    }
}
