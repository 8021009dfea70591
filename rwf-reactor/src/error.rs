use rwf_core::WireError;
use rwf_watchlist::WatchlistError;
use thiserror::Error;

use crate::config::ChannelId;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("transport failed: {0}")]
    Transport(anyhow::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Watchlist(#[from] WatchlistError),

    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("channel {0} is down")]
    ChannelDown(ChannelId),

    #[error("application event receiver is gone")]
    EventReceiverGone,
}
