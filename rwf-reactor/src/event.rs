use crossbeam_channel::Sender;
use rwf_watchlist::WatchlistEvent;

use crate::config::ChannelId;
use crate::error::ReactorError;

/// Событие реактора для приложения.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorEvent {
    ChannelUp(ChannelId),
    ChannelDown {
        channel: ChannelId,
        reason: String,
    },
    /// Событие watchlist'а канала (кроме `Send`: его реактор пишет в транспорт сам)
    Watchlist {
        channel: ChannelId,
        event: WatchlistEvent,
    },
}

pub(crate) fn emit(sink: &Sender<ReactorEvent>, event: ReactorEvent) -> Result<(), ReactorError> {
    sink.send(event).map_err(|_| ReactorError::EventReceiverGone)
}
