use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvError, Select, Sender};
use log::{debug, info};
use rwf_core::{PostMsg, RequestMsg, StreamId};
use rwf_watchlist::{RequestOptions, Watchlist, WatchlistError, WatchlistEvent};

use crate::channel::{DISCONNECTED_TEXT, RECONNECTED_TEXT, ReactorChannel};
use crate::config::{ChannelId, ReactorConfig};
use crate::error::ReactorError;
use crate::event::{ReactorEvent, emit};
use crate::transport::Transport;

/// Однопоточный цикл событий над набором каналов.
///
/// Единственная блокирующая точка: ожидание в [`Reactor::dispatch`].
/// События для приложения уходят в crossbeam-канал, полученный из
/// [`Reactor::new`].
pub struct Reactor {
    config: ReactorConfig,
    channels: BTreeMap<ChannelId, ReactorChannel>,
    next_channel_id: ChannelId,
    events: Sender<ReactorEvent>,
    started: Instant,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> (Self, Receiver<ReactorEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        let reactor = Self {
            config,
            channels: BTreeMap::new(),
            next_channel_id: 0,
            events,
            started: Instant::now(),
        };
        (reactor, rx)
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Новый канал со своим watchlist'ом. Канал сразу считается поднятым.
    pub fn add_channel(
        &mut self,
        transport: impl Transport + 'static,
        inbound: Receiver<Vec<u8>>,
    ) -> Result<ChannelId, ReactorError> {
        let mut watchlist = Watchlist::new(self.config.watchlist.clone())?;
        watchlist.channel_up()?;

        let id = self.next_channel_id;
        self.next_channel_id += 1;

        let channel = ReactorChannel::new(
            id,
            watchlist,
            Box::new(transport),
            inbound,
            &self.config,
            Instant::now(),
        );
        self.channels.insert(id, channel);
        info!("channel {id} added");

        emit(&self.events, ReactorEvent::ChannelUp(id))?;
        Ok(id)
    }

    /// Подключить упавший (или живой) канал к новому транспорту.
    pub fn reconnect(
        &mut self,
        channel: ChannelId,
        transport: impl Transport + 'static,
        inbound: Receiver<Vec<u8>>,
    ) -> Result<(), ReactorError> {
        let now = Instant::now();
        let now_ms = self.millis(now);
        let ch = self
            .channels
            .get_mut(&channel)
            .ok_or(ReactorError::UnknownChannel(channel))?;

        if ch.is_up() {
            ch.fail(RECONNECTED_TEXT, &self.events)?;
        }
        ch.attach(Box::new(transport), inbound, now)?;
        emit(&self.events, ReactorEvent::ChannelUp(channel))?;
        ch.flush(now, now_ms, &self.events)?;
        Ok(())
    }

    pub fn watchlist(&self, channel: ChannelId) -> Option<&Watchlist> {
        self.channels.get(&channel).map(|c| c.watchlist())
    }

    pub fn is_channel_up(&self, channel: ChannelId) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.is_up())
    }

    // --- запросы приложения ---

    pub fn submit_request(
        &mut self,
        channel: ChannelId,
        request: RequestMsg,
        options: RequestOptions,
    ) -> Result<(), ReactorError> {
        self.with_watchlist(channel, |wl, _| wl.submit_request(request, options))
    }

    pub fn close_request(
        &mut self,
        channel: ChannelId,
        stream_id: StreamId,
    ) -> Result<(), ReactorError> {
        self.with_watchlist(channel, |wl, _| wl.close_request(stream_id))
    }

    pub fn submit_post(&mut self, channel: ChannelId, post: PostMsg) -> Result<(), ReactorError> {
        self.with_watchlist(channel, |wl, now_ms| wl.submit_post(post, now_ms))
    }

    /// Вызов watchlist'а от имени приложения + немедленная отправка
    /// накопленного.
    fn with_watchlist<F>(&mut self, channel: ChannelId, f: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&mut Watchlist, u64) -> Result<Vec<WatchlistEvent>, WatchlistError>,
    {
        let now = Instant::now();
        let now_ms = self.millis(now);
        let ch = self
            .channels
            .get_mut(&channel)
            .ok_or(ReactorError::UnknownChannel(channel))?;

        let events = f(ch.watchlist_mut(), now_ms)?;
        ch.forward(events, now, &self.events)?;
        ch.flush(now, now_ms, &self.events)?;
        Ok(())
    }

    // --- цикл ---

    /// Один шаг цикла: ждём входящих не дольше `max_wait` (и не дольше
    /// ближайшего ping/таймера), обрабатываем всё, что пришло, запускаем
    /// таймеры и отправку. Возвращает число событий, отданных приложению.
    pub fn dispatch(&mut self, max_wait: Duration) -> Result<usize, ReactorError> {
        let wait = self.wait_time(max_wait, Instant::now());
        let input = self.wait_for_input(wait);

        let now = Instant::now();
        let now_ms = self.millis(now);
        let mut forwarded = 0;

        if let Some((id, received)) = input {
            if let Some(channel) = self.channels.get_mut(&id) {
                forwarded += match received {
                    Ok(bytes) => channel.read(bytes, now, now_ms, &self.events)?,
                    Err(RecvError) => channel.fail(DISCONNECTED_TEXT, &self.events)?,
                };
            }
        }

        for channel in self.channels.values_mut() {
            forwarded += channel.service(now, now_ms, &self.events)?;
        }

        Ok(forwarded)
    }

    /// Крутит [`Reactor::dispatch`], пока не выставлен `shutdown`.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<(), ReactorError> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutting down reactor");
                break;
            }
            self.dispatch(self.config.tick)?;
        }
        Ok(())
    }

    fn millis(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started).as_millis();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }

    fn wait_time(&self, max_wait: Duration, now: Instant) -> Duration {
        let mut deadline = now + max_wait;
        for channel in self.channels.values() {
            if let Some(ping) = channel.ping_deadline() {
                deadline = deadline.min(ping);
            }
            if let Some(t) = channel.watchlist().next_timeout() {
                deadline = deadline.min(self.started + Duration::from_millis(t));
            }
        }
        deadline.saturating_duration_since(now)
    }

    /// Ждём первый кадр на любом из поднятых каналов.
    fn wait_for_input(&self, wait: Duration) -> Option<(ChannelId, Result<Vec<u8>, RecvError>)> {
        let receivers: Vec<(ChannelId, &Receiver<Vec<u8>>)> = self
            .channels
            .iter()
            .filter_map(|(id, c)| c.inbound().map(|rx| (*id, rx)))
            .collect();

        if receivers.is_empty() {
            if !wait.is_zero() {
                thread::sleep(wait);
            }
            return None;
        }

        let mut select = Select::new();
        for (_, rx) in &receivers {
            select.recv(*rx);
        }

        match select.select_timeout(wait) {
            Ok(oper) => {
                let (id, rx) = receivers[oper.index()];
                Some((id, oper.recv(rx)))
            }
            Err(_) => {
                debug!("reactor tick");
                None
            }
        }
    }
}
