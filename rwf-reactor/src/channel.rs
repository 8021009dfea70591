use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use rwf_core::wire::{Frame, decode_frame, encode_frame};
use rwf_watchlist::{InboundMsg, Watchlist, WatchlistError, WatchlistEvent};

use crate::config::{ChannelId, ReactorConfig};
use crate::error::ReactorError;
use crate::event::{ReactorEvent, emit};
use crate::ping::PingTracker;
use crate::transport::Transport;

pub(crate) const PING_TIMEOUT_TEXT: &str = "Ping timeout.";
pub(crate) const DISCONNECTED_TEXT: &str = "Transport disconnected.";
pub(crate) const RECONNECTED_TEXT: &str = "Channel reconnected.";

/// Канал реактора: watchlist + транспорт + контроль живости.
///
/// Пока канал лежит, `transport` и `inbound` пусты, а watchlist продолжает
/// жить: таймеры post-сообщений тикают, запросы ждут восстановления.
pub(crate) struct ReactorChannel {
    id: ChannelId,
    watchlist: Watchlist,
    transport: Option<Box<dyn Transport>>,
    inbound: Option<Receiver<Vec<u8>>>,
    ping: PingTracker,
    back_to_back_err_count: usize,
    write_error_limit: usize,
}

impl ReactorChannel {
    pub(crate) fn new(
        id: ChannelId,
        watchlist: Watchlist,
        transport: Box<dyn Transport>,
        inbound: Receiver<Vec<u8>>,
        config: &ReactorConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            watchlist,
            transport: Some(transport),
            inbound: Some(inbound),
            ping: PingTracker::new(config.ping_timeout, now),
            back_to_back_err_count: 0,
            write_error_limit: config.write_error_limit,
        }
    }

    pub(crate) fn is_up(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn watchlist(&self) -> &Watchlist {
        &self.watchlist
    }

    pub(crate) fn watchlist_mut(&mut self) -> &mut Watchlist {
        &mut self.watchlist
    }

    pub(crate) fn inbound(&self) -> Option<&Receiver<Vec<u8>>> {
        self.inbound.as_ref()
    }

    /// Ближайший момент, когда ping-трекеру нужно внимание.
    pub(crate) fn ping_deadline(&self) -> Option<Instant> {
        self.is_up().then(|| self.ping.next_deadline())
    }

    /// Новый транспорт для упавшего канала.
    pub(crate) fn attach(
        &mut self,
        transport: Box<dyn Transport>,
        inbound: Receiver<Vec<u8>>,
        now: Instant,
    ) -> Result<(), ReactorError> {
        self.transport = Some(transport);
        self.inbound = Some(inbound);
        self.ping = PingTracker::new(self.ping.timeout(), now);
        self.back_to_back_err_count = 0;
        self.watchlist.channel_up()?;
        info!("channel {} up", self.id);
        Ok(())
    }

    /// Пишет кадр. Ошибки записи подряд считаются; на пределе возвращает
    /// `ReactorError::Transport`.
    pub(crate) fn write_frame(&mut self, frame: &Frame, now: Instant) -> Result<(), ReactorError> {
        let bytes = encode_frame(frame)?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(ReactorError::ChannelDown(self.id));
        };

        match transport.write(&bytes) {
            Ok(()) => {
                self.back_to_back_err_count = 0;
                self.ping.sent(now);
            }
            Err(e) => {
                warn!("failed to write to channel {} due to {e}", self.id);
                self.back_to_back_err_count += 1;
                if self.back_to_back_err_count >= self.write_error_limit {
                    return Err(ReactorError::Transport(e));
                }
            }
        }
        Ok(())
    }

    /// `Send` уходят в транспорт, остальное приложению. Возвращает, сколько
    /// событий отдано приложению.
    pub(crate) fn forward(
        &mut self,
        events: Vec<WatchlistEvent>,
        now: Instant,
        sink: &Sender<ReactorEvent>,
    ) -> Result<usize, ReactorError> {
        let mut forwarded = 0;
        let mut failure = None;

        for event in events {
            match event {
                WatchlistEvent::Send(msg) => {
                    if failure.is_some() || !self.is_up() {
                        debug!("{msg} dropped: channel {} is down", self.id);
                        continue;
                    }
                    match self.write_frame(&Frame::unicast(msg), now) {
                        Ok(()) => {}
                        Err(ReactorError::Transport(e)) => failure = Some(e),
                        Err(e) => return Err(e),
                    }
                }
                event => {
                    emit(
                        sink,
                        ReactorEvent::Watchlist {
                            channel: self.id,
                            event,
                        },
                    )?;
                    forwarded += 1;
                }
            }
        }

        if let Some(e) = failure {
            forwarded += self.fail(&format!("Transport write failed: {e}"), sink)?;
        }
        Ok(forwarded)
    }

    /// Канал потерян: watchlist переводит запросы в ожидание восстановления.
    pub(crate) fn fail(
        &mut self,
        reason: &str,
        sink: &Sender<ReactorEvent>,
    ) -> Result<usize, ReactorError> {
        if !self.is_up() {
            return Ok(0);
        }

        warn!("channel {} down: {reason}", self.id);
        self.transport = None;
        self.inbound = None;

        let mut forwarded = 0;
        for event in self.watchlist.channel_down(reason) {
            if matches!(event, WatchlistEvent::Send(_)) {
                continue;
            }
            emit(
                sink,
                ReactorEvent::Watchlist {
                    channel: self.id,
                    event,
                },
            )?;
            forwarded += 1;
        }

        emit(
            sink,
            ReactorEvent::ChannelDown {
                channel: self.id,
                reason: reason.to_string(),
            },
        )?;
        Ok(forwarded + 1)
    }

    /// Один входящий кадр.
    pub(crate) fn read(
        &mut self,
        bytes: Vec<u8>,
        now: Instant,
        now_ms: u64,
        sink: &Sender<ReactorEvent>,
    ) -> Result<usize, ReactorError> {
        let frame = match decode_frame(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // мусор не роняет канал
                warn!("bad frame on channel {}: {e}", self.id);
                return Ok(0);
            }
        };
        self.ping.received(now);

        match frame {
            Frame::Ping => Ok(0),
            Frame::FtGroupPing(ft_group_id) => {
                self.watchlist.process_ft_group_ping(ft_group_id, now_ms);
                Ok(0)
            }
            Frame::Msg {
                msg,
                seq_num,
                ft_group_id,
            } => {
                let inbound = InboundMsg {
                    msg,
                    seq_num,
                    ft_group_id,
                };
                let result = self.watchlist.read_msg(inbound, now_ms);
                self.absorb(result, now, sink)
            }
        }
    }

    /// Отправить накопленное watchlist'ом.
    pub(crate) fn flush(
        &mut self,
        now: Instant,
        now_ms: u64,
        sink: &Sender<ReactorEvent>,
    ) -> Result<usize, ReactorError> {
        let result = self.watchlist.dispatch(now_ms);
        self.absorb(result, now, sink)
    }

    /// Результат вызова watchlist'а. Ошибка watchlist'а роняет только этот
    /// канал, остальные каналы реактора продолжают работу.
    pub(crate) fn absorb(
        &mut self,
        result: Result<Vec<WatchlistEvent>, WatchlistError>,
        now: Instant,
        sink: &Sender<ReactorEvent>,
    ) -> Result<usize, ReactorError> {
        match result {
            Ok(events) => self.forward(events, now, sink),
            Err(e) => {
                warn!("watchlist failed on channel {}: {e}", self.id);
                self.fail(&format!("Watchlist error: {e}"), sink)
            }
        }
    }

    /// Шаг обслуживания: входящие, живость, таймеры, отправка, ping.
    pub(crate) fn service(
        &mut self,
        now: Instant,
        now_ms: u64,
        sink: &Sender<ReactorEvent>,
    ) -> Result<usize, ReactorError> {
        let mut forwarded = 0;

        // разгребаем очередь
        loop {
            let received = match &self.inbound {
                Some(rx) => rx.try_recv(),
                None => break,
            };
            match received {
                Ok(bytes) => forwarded += self.read(bytes, now, now_ms, sink)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    forwarded += self.fail(DISCONNECTED_TEXT, sink)?;
                    break;
                }
            }
        }

        if self.is_up() && self.ping.is_expired(now) {
            info!("ping timeout on channel {}", self.id);
            forwarded += self.fail(PING_TIMEOUT_TEXT, sink)?;
        }

        if self.watchlist.next_timeout().is_some_and(|t| t <= now_ms) {
            let result = self.watchlist.process_timers(now_ms);
            forwarded += self.absorb(result, now, sink)?;
        }

        forwarded += self.flush(now, now_ms, sink)?;

        if self.is_up() && self.ping.ping_due(now) {
            debug!("ping on channel {}", self.id);
            match self.write_frame(&Frame::Ping, now) {
                Ok(()) => {}
                Err(ReactorError::Transport(e)) => {
                    forwarded += self.fail(&format!("Transport write failed: {e}"), sink)?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rwf_core::{DomainType, MsgKey, RequestMsg};
    use rwf_watchlist::{RequestOptions, WatchlistConfig};

    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn write(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("broken pipe")
        }
    }

    fn mk_channel(transport: Box<dyn Transport>, limit: usize) -> (ReactorChannel, Sender<Vec<u8>>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let config = ReactorConfig {
            write_error_limit: limit,
            ..ReactorConfig::default()
        };
        let mut watchlist = Watchlist::new(WatchlistConfig::default()).unwrap();
        watchlist.channel_up().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let channel = ReactorChannel::new(7, watchlist, transport, rx, &config, Instant::now());
        (channel, tx)
    }

    #[test]
    fn write_frame_fails_on_limit_of_back_to_back_errors() {
        let (mut channel, _tx) = mk_channel(Box::new(BrokenTransport), 3);
        let now = Instant::now();

        // первые (LIMIT-1) раз Ok, на LIMIT-й Err
        for _ in 0..2 {
            assert!(channel.write_frame(&Frame::Ping, now).is_ok());
        }
        let r = channel.write_frame(&Frame::Ping, now);
        assert!(matches!(r, Err(ReactorError::Transport(_))));
    }

    #[test]
    fn write_errors_bring_channel_down() {
        let (mut channel, _tx) = mk_channel(Box::new(BrokenTransport), 1);
        let (sink, events) = crossbeam_channel::unbounded();
        let now = Instant::now();

        let login = RequestMsg::new(1, DomainType::LOGIN, MsgKey::default());
        channel
            .watchlist_mut()
            .submit_request(login, RequestOptions::default())
            .unwrap();
        channel.flush(now, 0, &sink).unwrap();

        assert!(!channel.is_up());
        assert!(!channel.watchlist().is_channel_up());
        let down = events
            .try_iter()
            .find(|e| matches!(e, ReactorEvent::ChannelDown { .. }));
        match down {
            Some(ReactorEvent::ChannelDown { channel, reason }) => {
                assert_eq!(channel, 7);
                assert!(reason.starts_with("Transport write failed"));
            }
            other => panic!("expected ChannelDown, got {other:?}"),
        }
    }

    #[test]
    fn watchlist_error_brings_channel_down() {
        let (client, _provider) = crate::transport::memory_pair();
        let (mut channel, _tx) = mk_channel(Box::new(client.transport), 1);
        let (sink, events) = crossbeam_channel::unbounded();

        let err = WatchlistError::Invariant("broken reorder queue".to_string());
        channel.absorb(Err(err), Instant::now(), &sink).unwrap();
        assert!(!channel.is_up());
        assert!(!channel.watchlist().is_channel_up());
        let down = events
            .try_iter()
            .find(|e| matches!(e, ReactorEvent::ChannelDown { .. }));
        match down {
            Some(ReactorEvent::ChannelDown { channel, reason }) => {
                assert_eq!(channel, 7);
                assert_eq!(reason, "Watchlist error: invariant violated: broken reorder queue");
            }
            other => panic!("expected ChannelDown, got {other:?}"),
        }

        // упавший канал ошибку только логирует
        let err = WatchlistError::Invariant("again".to_string());
        assert_eq!(channel.absorb(Err(err), Instant::now(), &sink).unwrap(), 0);
    }

    #[test]
    fn ft_group_ping_counts_as_traffic() {
        let (client, _provider) = crate::transport::memory_pair();
        let (mut channel, _tx) = mk_channel(Box::new(client.transport), 1);
        let (sink, events) = crossbeam_channel::unbounded();

        let bytes = encode_frame(&Frame::FtGroupPing(3)).unwrap();
        let n = channel.read(bytes, Instant::now(), 0, &sink).unwrap();
        assert_eq!(n, 0);
        assert!(channel.is_up());
        assert_eq!(channel.watchlist().ft_group_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn garbage_frame_is_ignored() {
        let (client, _provider) = crate::transport::memory_pair();
        let (mut channel, _tx) = mk_channel(Box::new(client.transport), 1);
        let (sink, events) = crossbeam_channel::unbounded();

        let n = channel
            .read(vec![99, 1, 2, 3], Instant::now(), 0, &sink)
            .unwrap();
        assert_eq!(n, 0);
        assert!(channel.is_up());
        assert!(events.try_recv().is_err());
    }
}
