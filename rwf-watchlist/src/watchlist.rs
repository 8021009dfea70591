//! Watchlist одного канала.
//!
//! Принимает запросы приложения, схлопывает одинаковые в один поток к
//! провайдеру, ведёт login и directory, раздаёт ответы и следит за таймаутами.
//! Каждый вызов возвращает список [`WatchlistEvent`]; ввода-вывода здесь нет.

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::{debug, info, warn};
use rwf_core::constants::{DIRECTORY_STREAM_ID, LOGIN_STREAM_ID};
use rwf_core::{
    AckMsg, CloseMsg, DataState, DomainType, Msg, MsgKey, NakCode, Payload, PostMsg, RefreshMsg,
    RequestMsg, SeqNum, State, StatusCode, StatusMsg, StreamId, StreamState,
};

use crate::attributes::{AttributeTable, StreamAttributes, keys_match};
use crate::config::WatchlistConfig;
use crate::directory::{ServiceCache, ServiceUpdate};
use crate::error::WatchlistError;
use crate::event::{ChannelState, InboundMsg, StreamInfo, WatchlistEvent};
use crate::ft_group::FtGroupTable;
use crate::item::{ItemRequest, ItemStream, RefreshState, RequestPhase, ServiceRef};
use crate::pool::{Handle, Pool};
use crate::post_table::{PostAckTable, PostRecord};
use crate::registry::RequestRegistry;
use crate::stream_id::StreamIdAllocator;

/// Login и directory не входят в `stream_pool_count`.
const ADMIN_STREAM_COUNT: usize = 2;

/// info | state | group | load
const DIRECTORY_FILTER: u32 = 0x0F;

/// Дополнительные параметры запроса, которых нет в самом сообщении.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Вернётся в [`StreamInfo`] каждого события по этому запросу
    pub user_spec: Option<u64>,
    /// Сервис по имени вместо `key.service_id`
    pub service_name: Option<String>,
}

/// Login или directory-запрос приложения.
#[derive(Debug, Clone)]
struct AdminRequest {
    request: RequestMsg,
    user_spec: Option<u64>,
}

impl AdminRequest {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.request.stream_id,
            user_spec: self.user_spec,
        }
    }
}

/// Что сделать с потоком провайдера при его разборе.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Провайдер уже закрыл поток
    Release,
    /// CloseMsg уйдёт при следующем dispatch
    OnDispatch,
    /// CloseMsg уходит прямо в этом вызове
    Now,
}

pub(crate) fn status_msg(
    stream_id: StreamId,
    domain_type: DomainType,
    stream_state: StreamState,
    data_state: DataState,
    code: StatusCode,
    text: &str,
) -> Msg {
    StatusMsg::new(
        stream_id,
        domain_type,
        Some(State::new(stream_state, data_state, code, text)),
    )
    .into()
}

#[derive(Debug)]
pub struct Watchlist {
    pub(crate) config: WatchlistConfig,
    pub(crate) state: ChannelState,
    pub(crate) channel_up: bool,
    pub(crate) need_timer: bool,

    pub(crate) ids: StreamIdAllocator,
    pub(crate) registry: RequestRegistry,
    pub(crate) attributes: AttributeTable,
    pub(crate) streams: HashMap<StreamId, ItemStream>,

    pub(crate) requests: Pool<ItemRequest>,
    pub(crate) requests_by_app_id: HashMap<StreamId, Handle>,
    pub(crate) new_requests: VecDeque<Handle>,
    /// Запросы, ждущие появления сервиса
    pub(crate) waiting_by_id: HashMap<u16, Vec<Handle>>,
    pub(crate) waiting_by_name: HashMap<String, Vec<Handle>>,

    pub(crate) services: ServiceCache,
    pub(crate) posts: PostAckTable,

    login: Option<AdminRequest>,
    directory_requests: BTreeMap<StreamId, AdminRequest>,

    /// Потоки с пропуском в последовательности, в порядке появления пропуска
    pub(crate) gap_streams: VecDeque<StreamId>,
    pub(crate) gap_expire_time: Option<u64>,

    pub(crate) ft_groups: FtGroupTable,
}

impl Watchlist {
    pub fn new(config: WatchlistConfig) -> Result<Self, WatchlistError> {
        config.validate()?;

        Ok(Self {
            state: ChannelState::Start,
            channel_up: false,
            need_timer: false,
            ids: StreamIdAllocator::new(),
            registry: RequestRegistry::new(
                config.stream_pool_count + ADMIN_STREAM_COUNT,
                config.request_timeout_ms,
            ),
            attributes: AttributeTable::new(),
            streams: HashMap::new(),
            requests: Pool::with_capacity(config.request_pool_count),
            requests_by_app_id: HashMap::new(),
            new_requests: VecDeque::new(),
            waiting_by_id: HashMap::new(),
            waiting_by_name: HashMap::new(),
            services: ServiceCache::new(),
            posts: PostAckTable::new(config.max_outstanding_posts, config.post_ack_timeout_ms),
            login: None,
            directory_requests: BTreeMap::new(),
            gap_streams: VecDeque::new(),
            gap_expire_time: None,
            ft_groups: FtGroupTable::new(config.ft_group_timeout_ms),
            config,
        })
    }

    pub fn config(&self) -> &WatchlistConfig {
        &self.config
    }

    pub fn channel_state(&self) -> ChannelState {
        self.state
    }

    pub fn is_channel_up(&self) -> bool {
        self.channel_up
    }

    /// Есть ли хоть один запущенный таймер.
    pub fn need_timer(&self) -> bool {
        self.need_timer
    }

    /// Ближайший момент, когда нужно вызвать [`Watchlist::process_timers`].
    pub fn next_timeout(&self) -> Option<u64> {
        [
            self.registry.next_expire_time(),
            self.gap_expire_time,
            self.ft_groups.next_expire_time(),
            self.posts.next_expire_time(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn services(&self) -> &ServiceCache {
        &self.services
    }

    /// Wire stream id, на котором сейчас сидит запрос приложения.
    pub fn wire_stream_id(&self, app_stream_id: StreamId) -> Option<StreamId> {
        if self
            .login
            .as_ref()
            .is_some_and(|l| l.request.stream_id == app_stream_id)
        {
            return Some(LOGIN_STREAM_ID);
        }
        let handle = self.requests_by_app_id.get(&app_stream_id)?;
        self.requests.get(*handle).and_then(|r| r.stream)
    }

    pub fn is_pending_request(&self, stream_id: StreamId) -> bool {
        self.registry.is_pending_request(stream_id)
    }

    pub fn is_pending_response(&self, stream_id: StreamId) -> bool {
        self.registry.is_pending_response(stream_id)
    }

    /// Потоки к провайдеру (включая login, directory и закрывающиеся).
    pub fn open_stream_count(&self) -> usize {
        self.registry.len()
    }

    pub fn item_stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn outstanding_posts(&self) -> usize {
        self.posts.len()
    }

    /// FT-группы, от которых сейчас зависят потоки.
    pub fn ft_group_count(&self) -> usize {
        self.ft_groups.len()
    }

    /// Ping от узла FT-группы. Возвращает новый срок группы, если у неё есть
    /// потоки.
    pub fn process_ft_group_ping(&mut self, ft_group_id: u8, now: u64) -> Option<u64> {
        let expire_time = self.ft_groups.refresh(ft_group_id, now)?;
        self.need_timer = true;
        Some(expire_time)
    }

    // --- канал ---

    /// Канал поднят: login (если он уже есть) уйдёт при следующем dispatch.
    pub fn channel_up(&mut self) -> Result<(), WatchlistError> {
        if self.state == ChannelState::Closed {
            return Err(WatchlistError::ChannelClosed);
        }

        info!("channel up");
        self.channel_up = true;
        if self.login.is_some() {
            self.request_admin_stream(LOGIN_STREAM_ID, DomainType::LOGIN)?;
        }
        Ok(())
    }

    /// Канал потерян. Потоки провайдера забыты, запросы приложения ждут
    /// восстановления с данными SUSPECT.
    pub fn channel_down(&mut self, text: &str) -> Vec<WatchlistEvent> {
        let mut out = Vec::new();
        if !self.channel_up {
            return out;
        }

        warn!("channel down: {text}");
        self.channel_up = false;
        self.reset_session(text, true, &mut out);
        if self.state != ChannelState::Closed {
            self.set_state(ChannelState::Start, &mut out);
        }
        out
    }

    // --- запросы приложения ---

    pub fn submit_request(
        &mut self,
        request: RequestMsg,
        options: RequestOptions,
    ) -> Result<Vec<WatchlistEvent>, WatchlistError> {
        if self.state == ChannelState::Closed {
            return Err(WatchlistError::ChannelClosed);
        }

        let mut out = Vec::new();
        if request.domain_type == DomainType::LOGIN {
            self.submit_login(request, options)?;
        } else if request.domain_type == DomainType::SOURCE {
            self.submit_directory_request(request, options, &mut out);
        } else {
            self.submit_item_request(request, options)?;
        }
        Ok(out)
    }

    pub fn close_request(
        &mut self,
        stream_id: StreamId,
    ) -> Result<Vec<WatchlistEvent>, WatchlistError> {
        let mut out = Vec::new();

        if self
            .login
            .as_ref()
            .is_some_and(|l| l.request.stream_id == stream_id)
        {
            self.close_login(&mut out);
            return Ok(out);
        }

        if self.directory_requests.remove(&stream_id).is_some() {
            return Ok(out);
        }

        let Some(&handle) = self.requests_by_app_id.get(&stream_id) else {
            return Err(WatchlistError::UnknownStream(stream_id));
        };

        if let Some(wire) = self.requests.get(handle).and_then(|r| r.stream) {
            let now_empty = match self.streams.get_mut(&wire) {
                Some(stream) => {
                    stream.remove_request(handle);
                    stream.request_count() == 0
                }
                None => false,
            };
            if now_empty {
                self.teardown_stream(wire, CloseAction::OnDispatch, &mut out);
            }
        }

        debug!("request on stream {stream_id} closed by application");
        self.destroy_request(handle);
        Ok(out)
    }

    pub fn submit_post(
        &mut self,
        post: PostMsg,
        now: u64,
    ) -> Result<Vec<WatchlistEvent>, WatchlistError> {
        if self.state == ChannelState::Closed {
            return Err(WatchlistError::ChannelClosed);
        }

        let app_stream_id = post.stream_id;
        let wire = if self
            .login
            .as_ref()
            .is_some_and(|l| l.request.stream_id == app_stream_id)
        {
            // off-stream post идёт по login-потоку
            if !self.channel_up || !self.registry.contains(LOGIN_STREAM_ID) {
                return Err(WatchlistError::StreamNotOpen(app_stream_id));
            }
            LOGIN_STREAM_ID
        } else {
            let handle = *self
                .requests_by_app_id
                .get(&app_stream_id)
                .ok_or(WatchlistError::UnknownStream(app_stream_id))?;
            self.requests
                .get(handle)
                .and_then(|r| r.stream)
                .filter(|wire| self.streams.get(wire).is_some_and(|s| s.requested))
                .ok_or(WatchlistError::StreamNotOpen(app_stream_id))?
        };

        if post.ack {
            self.posts.add_record(app_stream_id, wire, &post, now)?;
            self.need_timer = true;
        }

        let mut msg = Msg::Post(post);
        msg.set_stream_id(wire);
        Ok(vec![WatchlistEvent::Send(msg)])
    }

    // --- сообщения провайдера ---

    pub fn read_msg(
        &mut self,
        inbound: InboundMsg,
        now: u64,
    ) -> Result<Vec<WatchlistEvent>, WatchlistError> {
        let mut out = Vec::new();
        if self.state == ChannelState::Closed {
            debug!("{} dropped: channel is closed", inbound.msg);
            return Ok(out);
        }

        let stream_id = inbound.msg.stream_id();

        // любое сообщение от FT-группы продлевает ей жизнь
        if let Some(ft_group_id) = inbound.ft_group_id {
            self.process_ft_group_ping(ft_group_id, now);
        }

        if let Msg::Ack(ack) = &inbound.msg {
            self.route_ack(ack.clone(), &mut out);
            return Ok(out);
        }

        if stream_id == 0 {
            self.route_broadcast(inbound, now, &mut out)?;
        } else if stream_id == LOGIN_STREAM_ID && self.is_admin_stream_open(LOGIN_STREAM_ID) {
            self.process_login_msg(inbound.msg, now, &mut out)?;
        } else if stream_id == DIRECTORY_STREAM_ID
            && self.is_admin_stream_open(DIRECTORY_STREAM_ID)
        {
            self.process_directory_msg(inbound.msg, now, &mut out)?;
        } else if self.streams.contains_key(&stream_id) {
            self.process_item_msg(stream_id, inbound, now, &mut out)?;
        } else if !self.registry.contains(stream_id) {
            // Провайдер мог закрыть поток одновременно с нашим переоткрытием
            // того же id: закрываем явно.
            let closed = inbound.msg.state().is_some_and(|s| !s.is_open());
            if closed && self.channel_up {
                debug!("{} on unknown stream, sending close", inbound.msg);
                self.registry
                    .add_temporary(stream_id, inbound.msg.domain_type());
            }
        }

        Ok(out)
    }

    /// Отправить всё, что накопилось: новые запросы, переотправки, CloseMsg.
    pub fn dispatch(&mut self, now: u64) -> Result<Vec<WatchlistEvent>, WatchlistError> {
        let mut out = Vec::new();
        if self.state == ChannelState::Closed || !self.channel_up {
            return Ok(out);
        }

        if self.state == ChannelState::Ready {
            while let Some(handle) = self.new_requests.pop_front() {
                self.attach_request(handle, &mut out)?;
            }
        }

        let mut deferred = Vec::new();
        while let Some(stream_id) = self.registry.pop_pending_request() {
            let Some(base) = self.registry.get(stream_id) else {
                continue;
            };

            if base.is_closing {
                let domain_type = base.domain_type;
                debug!("closing stream {stream_id}");
                out.push(WatchlistEvent::Send(
                    CloseMsg::new(stream_id, domain_type).into(),
                ));
                self.registry.remove(stream_id);
                continue;
            }

            match stream_id {
                LOGIN_STREAM_ID => self.send_login_request(now, &mut out),
                DIRECTORY_STREAM_ID => self.send_directory_request(now, &mut out),
                _ => {
                    if !self.send_item_request(stream_id, now, &mut out) {
                        deferred.push(stream_id);
                    }
                }
            }

            if let Some(WatchlistEvent::Send(msg)) = out.last() {
                debug!("sent {msg}");
            }
        }

        for stream_id in deferred {
            self.registry.set_pending_request(stream_id);
        }

        Ok(out)
    }

    pub fn process_timers(&mut self, now: u64) -> Result<Vec<WatchlistEvent>, WatchlistError> {
        let mut out = Vec::new();
        if self.state == ChannelState::Closed {
            return Ok(out);
        }

        for stream_id in self.registry.take_expired(now) {
            self.request_timed_out(stream_id, &mut out);
        }

        for (ft_group_id, stream_ids) in self.ft_groups.take_expired(now) {
            warn!(
                "ft group {ft_group_id} is silent, recovering {} streams",
                stream_ids.len()
            );
            for stream_id in stream_ids {
                let Some(stream) = self.streams.get(&stream_id) else {
                    continue;
                };
                let status = status_msg(
                    stream_id,
                    stream.domain_type(),
                    StreamState::ClosedRecover,
                    DataState::Suspect,
                    StatusCode::Timeout,
                    "Fault-tolerant Group timeout.",
                );
                self.close_and_recover(stream_id, status, CloseAction::OnDispatch, &mut out);
            }
        }

        if self.gap_expire_time.is_some_and(|t| t <= now) {
            self.gap_timer_expired(now, &mut out)?;
        }

        for record in self.posts.take_expired(now) {
            self.post_timed_out(record, &mut out);
        }

        self.need_timer = self.next_timeout().is_some();
        Ok(out)
    }

    // --- login / directory ---

    fn submit_login(
        &mut self,
        request: RequestMsg,
        options: RequestOptions,
    ) -> Result<(), WatchlistError> {
        if let Some(login) = &self.login {
            if login.request.stream_id != request.stream_id {
                return Err(WatchlistError::StreamInUse(login.request.stream_id));
            }
        }
        if self.requests_by_app_id.contains_key(&request.stream_id) {
            return Err(WatchlistError::StreamInUse(request.stream_id));
        }

        debug!(
            "login on stream {} {}",
            request.stream_id,
            if self.login.is_some() { "reissued" } else { "submitted" }
        );
        self.login = Some(AdminRequest {
            request,
            user_spec: options.user_spec,
        });

        if self.channel_up {
            self.request_admin_stream(LOGIN_STREAM_ID, DomainType::LOGIN)?;
        }
        Ok(())
    }

    fn submit_directory_request(
        &mut self,
        request: RequestMsg,
        options: RequestOptions,
        out: &mut Vec<WatchlistEvent>,
    ) {
        let app = AdminRequest {
            request,
            user_spec: options.user_spec,
        };

        // Кэш уже собран: отвечаем сразу из него
        if self.state == ChannelState::Ready {
            let mut refresh = RefreshMsg::new(
                app.request.stream_id,
                DomainType::SOURCE,
                State::open_ok(),
            );
            if !app.request.streaming {
                refresh.state.stream_state = StreamState::NonStreaming;
            }
            refresh.key = Some(app.request.key.clone());
            refresh.payload = Payload::Directory(self.services.to_entries());
            out.push(WatchlistEvent::deliver(app.info(), refresh.into()));

            if !app.request.streaming {
                return;
            }
        }

        self.directory_requests.insert(app.request.stream_id, app);
    }

    fn is_admin_stream_open(&self, stream_id: StreamId) -> bool {
        self.registry
            .get(stream_id)
            .is_some_and(|b| !b.is_closing && !b.is_temporary)
    }

    fn request_admin_stream(
        &mut self,
        stream_id: StreamId,
        domain_type: DomainType,
    ) -> Result<(), WatchlistError> {
        if !self.registry.contains(stream_id) {
            self.registry.add(stream_id, domain_type)?;
        }
        self.registry.set_pending_request(stream_id);
        Ok(())
    }

    fn send_login_request(&mut self, now: u64, out: &mut Vec<WatchlistEvent>) {
        let Some(login) = &self.login else {
            self.registry.remove(LOGIN_STREAM_ID);
            return;
        };

        let mut request = login.request.clone();
        request.stream_id = LOGIN_STREAM_ID;
        out.push(WatchlistEvent::Send(request.into()));

        self.registry.set_pending_response(LOGIN_STREAM_ID, now);
        self.need_timer = true;
        if self.state == ChannelState::Start {
            self.set_state(ChannelState::LoginRequested, out);
        }
    }

    fn send_directory_request(&mut self, now: u64, out: &mut Vec<WatchlistEvent>) {
        let key = MsgKey {
            filter: Some(DIRECTORY_FILTER),
            ..MsgKey::default()
        };
        let request = RequestMsg::new(DIRECTORY_STREAM_ID, DomainType::SOURCE, key);
        out.push(WatchlistEvent::Send(request.into()));

        self.registry.set_pending_response(DIRECTORY_STREAM_ID, now);
        self.need_timer = true;
    }

    /// `false` — окно сервиса заполнено, запрос подождёт.
    fn send_item_request(
        &mut self,
        stream_id: StreamId,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> bool {
        let Some(stream) = self.streams.get(&stream_id) else {
            return true;
        };

        if self.config.obey_open_window {
            let window = self
                .services
                .by_id(stream.service_id)
                .and_then(|s| s.open_window)
                .filter(|w| *w > 0);
            if let Some(window) = window {
                let in_flight = self
                    .streams
                    .values()
                    .filter(|s| {
                        s.service_id == stream.service_id
                            && self.registry.is_pending_response(s.stream_id)
                    })
                    .count();
                if in_flight >= window as usize {
                    debug!(
                        "open window of service {} is full ({window}), stream {stream_id} waits",
                        stream.service_id
                    );
                    return false;
                }
            }
        }

        let streaming = stream
            .requests()
            .any(|h| self.requests.get(h).is_some_and(|r| r.streaming));
        let request = RequestMsg {
            stream_id,
            domain_type: stream.domain_type(),
            key: stream.attributes.msg_key.clone(),
            qos: stream.attributes.qos,
            streaming,
            private_stream: stream.private,
        };
        out.push(WatchlistEvent::Send(request.into()));

        self.registry.set_pending_response(stream_id, now);
        self.need_timer = true;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.requested = true;
            stream.refresh_state = RefreshState::PendingRefresh;
        }
        true
    }

    fn process_login_msg(
        &mut self,
        msg: Msg,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let Some(info) = self.login.as_ref().map(AdminRequest::info) else {
            return Ok(());
        };

        if let Msg::Refresh(refresh) = &msg {
            if refresh.solicited {
                if refresh.complete {
                    self.registry.unset_pending_response(LOGIN_STREAM_ID);
                } else {
                    self.registry.reset_pending_response(LOGIN_STREAM_ID, now);
                }
            }
        }

        let state = msg.state().cloned();
        let mut msg = msg;
        msg.set_stream_id(info.stream_id);

        match state {
            Some(s) if s.stream_state == StreamState::ClosedRecover => {
                warn!("login stream closed by provider, recovering: {s}");
                override_state(&mut msg, StreamState::Open, DataState::Suspect);
                out.push(WatchlistEvent::deliver(info, msg));

                self.reset_session(&s.text, false, out);
                self.set_state(ChannelState::Start, out);
                if self.channel_up {
                    self.request_admin_stream(LOGIN_STREAM_ID, DomainType::LOGIN)?;
                }
            }
            Some(s) if !s.is_open() => {
                warn!("login stream closed by provider: {s}");
                out.push(WatchlistEvent::deliver(info, msg));
                self.close_session("Login stream was closed.", out);
            }
            Some(s) => {
                let logged_in = matches!(msg, Msg::Refresh(_))
                    && s.data_state == DataState::Ok
                    && matches!(
                        self.state,
                        ChannelState::Start | ChannelState::LoginRequested
                    );
                out.push(WatchlistEvent::deliver(info, msg));

                if logged_in {
                    self.set_state(ChannelState::LoggedIn, out);
                    self.request_admin_stream(DIRECTORY_STREAM_ID, DomainType::SOURCE)?;
                }
            }
            None => out.push(WatchlistEvent::deliver(info, msg)),
        }
        Ok(())
    }

    fn process_directory_msg(
        &mut self,
        msg: Msg,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let mut refresh_complete = false;
        if let Msg::Refresh(refresh) = &msg {
            refresh_complete = refresh.complete;
            if refresh.solicited {
                if refresh.complete {
                    self.registry.unset_pending_response(DIRECTORY_STREAM_ID);
                } else {
                    self.registry
                        .reset_pending_response(DIRECTORY_STREAM_ID, now);
                }
            }
        }

        match msg.state().cloned() {
            Some(s) if s.stream_state == StreamState::ClosedRecover => {
                warn!("directory stream closed by provider, recovering: {s}");
                let mut msg = msg;
                override_state(&mut msg, StreamState::Open, DataState::Suspect);
                self.forward_to_directory_requests(&msg, out);

                let updates = self.services.clear();
                self.apply_service_updates(updates, out);
                if self.state == ChannelState::Ready {
                    self.set_state(ChannelState::LoggedIn, out);
                }
                self.registry.unset_from_all_pending_lists(DIRECTORY_STREAM_ID);
                self.request_admin_stream(DIRECTORY_STREAM_ID, DomainType::SOURCE)?;
            }
            Some(s) if !s.is_open() => {
                warn!("directory stream closed by provider: {s}");
                self.forward_to_directory_requests(&msg, out);
                self.directory_requests.clear();
                self.close_session("Directory stream was closed.", out);
            }
            _ => {
                let updates = match &msg {
                    Msg::Refresh(refresh) => match &refresh.payload {
                        Payload::Directory(entries) => {
                            self.services.apply(entries, refresh.clear_cache)
                        }
                        _ => Vec::new(),
                    },
                    Msg::Update(update) => match &update.payload {
                        Payload::Directory(entries) => self.services.apply(entries, false),
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                };

                self.forward_to_directory_requests(&msg, out);
                self.apply_service_updates(updates, out);

                if refresh_complete && self.state == ChannelState::LoggedIn {
                    self.set_state(ChannelState::Ready, out);
                }
            }
        }
        Ok(())
    }

    /// Копия directory-сообщения каждому directory-запросу приложения.
    fn forward_to_directory_requests(&mut self, msg: &Msg, out: &mut Vec<WatchlistEvent>) {
        let refresh_complete = matches!(msg, Msg::Refresh(r) if r.complete);

        for app in self.directory_requests.values() {
            let mut copy = msg.clone();
            copy.set_stream_id(app.request.stream_id);
            if let Msg::Refresh(refresh) = &mut copy {
                if !app.request.streaming && refresh.state.is_open() {
                    refresh.state.stream_state = StreamState::NonStreaming;
                }
            }
            out.push(WatchlistEvent::deliver(app.info(), copy));
        }

        if refresh_complete {
            self.directory_requests.retain(|_, app| app.request.streaming);
        }
    }

    fn apply_service_updates(&mut self, updates: Vec<ServiceUpdate>, out: &mut Vec<WatchlistEvent>) {
        for update in updates {
            if update.available {
                let mut woken = self
                    .waiting_by_id
                    .remove(&update.service_id)
                    .unwrap_or_default();
                if let Some(name) = &update.name {
                    woken.extend(self.waiting_by_name.remove(name).unwrap_or_default());
                }

                if !woken.is_empty() {
                    info!(
                        "service {} is available, {} requests resume",
                        update.service_id,
                        woken.len()
                    );
                }
                for handle in woken {
                    if let Some(item) = self.requests.get_mut(handle) {
                        item.phase = RequestPhase::New;
                        self.new_requests.push_back(handle);
                    }
                }
            } else {
                let mut affected: Vec<StreamId> = self
                    .streams
                    .values()
                    .filter(|s| s.service_id == update.service_id)
                    .map(|s| s.stream_id)
                    .collect();
                affected.sort_unstable();

                if !affected.is_empty() {
                    warn!(
                        "service {} is down, recovering {} streams",
                        update.service_id,
                        affected.len()
                    );
                }
                for stream_id in affected {
                    let Some(domain_type) = self.streams.get(&stream_id).map(|s| s.domain_type())
                    else {
                        continue;
                    };
                    let status = status_msg(
                        stream_id,
                        domain_type,
                        StreamState::ClosedRecover,
                        DataState::Suspect,
                        StatusCode::None,
                        "Service is down.",
                    );
                    self.close_and_recover(stream_id, status, CloseAction::Release, out);
                }
            }
        }
    }

    fn close_login(&mut self, out: &mut Vec<WatchlistEvent>) {
        if self.channel_up && self.is_admin_stream_open(LOGIN_STREAM_ID) {
            out.push(WatchlistEvent::Send(
                CloseMsg::new(LOGIN_STREAM_ID, DomainType::LOGIN).into(),
            ));
        }

        info!("login closed by application");
        self.clear_all();
        self.login = None;
        self.directory_requests.clear();
        self.set_state(ChannelState::Closed, out);
    }

    /// Сессия закрыта провайдером насовсем: все запросы получают CLOSED.
    fn close_session(&mut self, text: &str, out: &mut Vec<WatchlistEvent>) {
        let handles: Vec<Handle> = self.requests.iter().map(|(h, _)| h).collect();
        for handle in handles {
            let Some(item) = self.requests.get(handle) else {
                continue;
            };
            let status = status_msg(
                item.app_stream_id,
                item.domain_type,
                StreamState::Closed,
                DataState::Suspect,
                StatusCode::None,
                text,
            );
            self.deliver_to_request(handle, &status, None, None, out);
        }

        for app in self.directory_requests.values() {
            let status = status_msg(
                app.request.stream_id,
                DomainType::SOURCE,
                StreamState::Closed,
                DataState::Suspect,
                StatusCode::None,
                text,
            );
            out.push(WatchlistEvent::deliver(app.info(), status));
        }

        self.clear_all();
        self.login = None;
        self.directory_requests.clear();
        self.set_state(ChannelState::Closed, out);
    }

    /// Забывает потоки провайдера. Запросы приложения остаются и будут
    /// переоткрыты, приватные закрываются как ClosedRecover.
    fn reset_session(&mut self, text: &str, notify_login: bool, out: &mut Vec<WatchlistEvent>) {
        let mut stream_ids: Vec<StreamId> = self.streams.keys().copied().collect();
        stream_ids.sort_unstable();

        for stream_id in stream_ids {
            let Some(mut stream) = self.streams.remove(&stream_id) else {
                continue;
            };
            for handle in stream.take_requests() {
                let Some(item) = self.requests.get(handle) else {
                    continue;
                };
                let stream_state = if stream.private {
                    StreamState::ClosedRecover
                } else {
                    StreamState::Open
                };
                let status = status_msg(
                    item.app_stream_id,
                    item.domain_type,
                    stream_state,
                    DataState::Suspect,
                    StatusCode::None,
                    text,
                );
                self.deliver_to_request(handle, &status, None, None, out);

                if stream.private {
                    self.destroy_request(handle);
                } else {
                    self.requeue_request(handle);
                }
            }
        }

        for app in self.directory_requests.values() {
            let status = status_msg(
                app.request.stream_id,
                DomainType::SOURCE,
                StreamState::Open,
                DataState::Suspect,
                StatusCode::None,
                text,
            );
            out.push(WatchlistEvent::deliver(app.info(), status));
        }

        if notify_login {
            if let Some(login) = &self.login {
                let status = status_msg(
                    login.request.stream_id,
                    DomainType::LOGIN,
                    StreamState::Open,
                    DataState::Suspect,
                    StatusCode::None,
                    text,
                );
                out.push(WatchlistEvent::deliver(login.info(), status));
            }
        }

        self.registry.clear();
        self.attributes.clear();
        self.gap_streams.clear();
        self.gap_expire_time = None;
        self.ft_groups.clear();
        // ждущие сервиса запросы проснутся от нового directory refresh
        self.services.clear();
        self.need_timer = self.next_timeout().is_some();
    }

    fn clear_all(&mut self) {
        self.registry.clear();
        self.attributes.clear();
        self.streams.clear();
        self.requests.clear();
        self.requests_by_app_id.clear();
        self.new_requests.clear();
        self.waiting_by_id.clear();
        self.waiting_by_name.clear();
        self.posts.clear();
        self.services.clear();
        self.gap_streams.clear();
        self.gap_expire_time = None;
        self.ft_groups.clear();
        self.need_timer = false;
    }

    fn set_state(&mut self, state: ChannelState, out: &mut Vec<WatchlistEvent>) {
        if self.state != state {
            info!("channel state {} -> {}", self.state, state);
            self.state = state;
            out.push(WatchlistEvent::ChannelState(state));
        }
    }

    // --- маршрутизация ---

    fn route_ack(&mut self, ack: AckMsg, out: &mut Vec<WatchlistEvent>) {
        let Some(handle) = self.posts.find_record(ack.stream_id, ack.ack_id, ack.seq_num) else {
            debug!(
                "ack {} on stream {} matches no outstanding post",
                ack.ack_id, ack.stream_id
            );
            return;
        };
        let Some(record) = self.posts.remove_record(handle) else {
            return;
        };
        let Some(info) = self.owner_info(record.owner) else {
            return;
        };

        let mut msg = Msg::Ack(ack);
        msg.set_stream_id(record.owner);
        out.push(WatchlistEvent::deliver(info, msg));
    }

    /// Сообщение со stream id 0 достаётся каждому потоку с подходящими
    /// атрибутами (QoS в таких сообщениях нет).
    fn route_broadcast(
        &mut self,
        inbound: InboundMsg,
        now: u64,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let domain_type = inbound.msg.domain_type();

        if domain_type == DomainType::LOGIN {
            if self.is_admin_stream_open(LOGIN_STREAM_ID) {
                self.process_login_msg(inbound.msg, now, out)?;
            }
            return Ok(());
        }
        if domain_type == DomainType::SOURCE {
            if self.is_admin_stream_open(DIRECTORY_STREAM_ID) {
                self.process_directory_msg(inbound.msg, now, out)?;
            }
            return Ok(());
        }

        let Some(key) = inbound.msg.key().cloned() else {
            debug!("{} without key dropped", inbound.msg);
            return Ok(());
        };

        let targets = self
            .attributes
            .find_all(&StreamAttributes::new(domain_type, key, None));
        for stream_id in targets {
            self.process_item_msg(stream_id, inbound.clone(), now, out)?;
        }
        Ok(())
    }

    fn owner_info(&self, app_stream_id: StreamId) -> Option<StreamInfo> {
        if let Some(login) = &self.login {
            if login.request.stream_id == app_stream_id {
                return Some(login.info());
            }
        }
        let handle = self.requests_by_app_id.get(&app_stream_id)?;
        self.requests.get(*handle).map(ItemRequest::info)
    }

    // --- запросы и потоки ---

    fn submit_item_request(
        &mut self,
        request: RequestMsg,
        options: RequestOptions,
    ) -> Result<(), WatchlistError> {
        if let Some(&handle) = self.requests_by_app_id.get(&request.stream_id) {
            return self.reissue(handle, request);
        }
        if self
            .login
            .as_ref()
            .is_some_and(|l| l.request.stream_id == request.stream_id)
        {
            return Err(WatchlistError::StreamInUse(request.stream_id));
        }

        let service = match (options.service_name, request.key.service_id) {
            (Some(name), _) => ServiceRef::Name(name),
            (None, Some(id)) => ServiceRef::Id(id),
            (None, None) => return Err(WatchlistError::MissingService(request.stream_id)),
        };

        let app_stream_id = request.stream_id;
        let item = ItemRequest {
            app_stream_id,
            user_spec: options.user_spec,
            domain_type: request.domain_type,
            key: request.key,
            qos: request.qos,
            streaming: request.streaming,
            private: request.private_stream,
            service,
            stream: None,
            phase: RequestPhase::New,
            suspect_notified: false,
        };

        let handle = self
            .requests
            .insert(item)
            .map_err(|_| WatchlistError::PoolExhausted {
                what: "request",
                capacity: self.requests.capacity(),
            })?;
        self.requests_by_app_id.insert(app_stream_id, handle);
        self.new_requests.push_back(handle);
        debug!("request on stream {app_stream_id} queued");
        Ok(())
    }

    /// Повторный запрос по тому же stream id: новый refresh, без нового потока.
    fn reissue(&mut self, handle: Handle, request: RequestMsg) -> Result<(), WatchlistError> {
        let Some(item) = self.requests.get_mut(handle) else {
            return Err(WatchlistError::UnknownStream(request.stream_id));
        };
        if item.domain_type != request.domain_type || !keys_match(&item.key, &request.key) {
            return Err(WatchlistError::KeyMismatchOnReissue(request.stream_id));
        }

        item.streaming = request.streaming;
        if item.phase != RequestPhase::Open {
            // refresh и так придёт
            return Ok(());
        }
        let Some(stream_id) = item.stream else {
            return Ok(());
        };

        debug!("request on stream {} reissued", request.stream_id);
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.remove_request(handle);
        }
        self.join_stream(stream_id, handle);
        Ok(())
    }

    /// Привязывает запрос к потоку провайдера: существующему или новому.
    fn attach_request(
        &mut self,
        handle: Handle,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let Some(item) = self.requests.get(handle) else {
            return Ok(());
        };

        let service = match &item.service {
            ServiceRef::Id(id) => self.services.by_id(*id),
            ServiceRef::Name(name) => self.services.by_name(name),
        };
        let resolved = service
            .filter(|s| s.is_available())
            .map(|s| (s.id, s.qos.first().copied()));
        let (domain_type, mut key, qos, private) =
            (item.domain_type, item.key.clone(), item.qos, item.private);

        let Some((service_id, service_qos)) = resolved else {
            self.park_request(handle, out);
            return Ok(());
        };

        key.service_id = Some(service_id);
        let attributes = StreamAttributes::new(domain_type, key, qos.or(service_qos));

        if !private {
            if let Some(stream_id) = self.attributes.find(&attributes) {
                self.join_stream(stream_id, handle);
                return Ok(());
            }
        }

        self.open_stream(handle, attributes, service_id, private, out)
    }

    fn open_stream(
        &mut self,
        handle: Handle,
        attributes: StreamAttributes,
        service_id: u16,
        private: bool,
        out: &mut Vec<WatchlistEvent>,
    ) -> Result<(), WatchlistError> {
        let stream_id = self.ids.take_stream_id(|id| self.registry.contains(id));

        match self.registry.add(stream_id, attributes.domain_type) {
            Ok(()) => {}
            Err(err @ WatchlistError::PoolExhausted { .. }) => {
                warn!("cannot open {}: {err}", attributes.msg_key);
                if let Some(item) = self.requests.get(handle) {
                    let status = status_msg(
                        item.app_stream_id,
                        item.domain_type,
                        StreamState::Closed,
                        DataState::Suspect,
                        StatusCode::UsageError,
                        "Too many streams.",
                    );
                    self.deliver_to_request(handle, &status, None, None, out);
                }
                self.destroy_request(handle);
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        debug!(
            "stream {stream_id} opened for {} on service {service_id}",
            attributes.msg_key
        );
        if !private {
            self.attributes.insert(attributes.clone(), stream_id);
        }

        let mut stream = ItemStream::new(
            stream_id,
            attributes,
            service_id,
            private,
            self.config.max_buffered_broadcast_msgs,
        );
        stream.pending_refresh.push(handle);
        self.streams.insert(stream_id, stream);

        if let Some(item) = self.requests.get_mut(handle) {
            item.stream = Some(stream_id);
            item.phase = RequestPhase::PendingRefresh;
        }
        self.registry.set_pending_request(stream_id);
        Ok(())
    }

    /// Подсаживает запрос на существующий поток. Посреди многочастного
    /// refresh запрос ждёт его окончания, иначе поток запрашивается заново.
    pub(crate) fn join_stream(&mut self, stream_id: StreamId, handle: Handle) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        let phase = match stream.refresh_state {
            RefreshState::PendingRefreshComplete => {
                stream.waiting.push(handle);
                RequestPhase::Waiting
            }
            RefreshState::PendingRefresh => {
                stream.pending_refresh.push(handle);
                RequestPhase::PendingRefresh
            }
            RefreshState::None => {
                stream.pending_refresh.push(handle);
                stream.refresh_state = RefreshState::PendingRefresh;
                self.registry.set_pending_request(stream_id);
                RequestPhase::PendingRefresh
            }
        };

        if let Some(item) = self.requests.get_mut(handle) {
            item.stream = Some(stream_id);
            item.phase = phase;
        }
    }

    /// Запрос ждёт, пока сервис появится в directory.
    fn park_request(&mut self, handle: Handle, out: &mut Vec<WatchlistEvent>) {
        let Some(item) = self.requests.get_mut(handle) else {
            return;
        };
        item.phase = RequestPhase::WaitingForService;
        item.stream = None;

        match &item.service {
            ServiceRef::Id(id) => self.waiting_by_id.entry(*id).or_default().push(handle),
            ServiceRef::Name(name) => self
                .waiting_by_name
                .entry(name.clone())
                .or_default()
                .push(handle),
        }

        if !item.suspect_notified {
            let status = status_msg(
                item.app_stream_id,
                item.domain_type,
                StreamState::Open,
                DataState::Suspect,
                StatusCode::None,
                "No matching service present.",
            );
            self.deliver_to_request(handle, &status, None, None, out);
        }
    }

    /// Запрос снова в очереди новых: поток, на котором он сидел, потерян.
    pub(crate) fn requeue_request(&mut self, handle: Handle) {
        if let Some(item) = self.requests.get_mut(handle) {
            item.stream = None;
            item.phase = RequestPhase::New;
            self.new_requests.push_back(handle);
        }
    }

    pub(crate) fn destroy_request(&mut self, handle: Handle) {
        let Some(item) = self.requests.remove(handle) else {
            return;
        };
        self.requests_by_app_id.remove(&item.app_stream_id);

        match item.phase {
            RequestPhase::New => self.new_requests.retain(|h| *h != handle),
            RequestPhase::WaitingForService => match &item.service {
                ServiceRef::Id(id) => {
                    if let Some(list) = self.waiting_by_id.get_mut(id) {
                        list.retain(|h| *h != handle);
                        if list.is_empty() {
                            self.waiting_by_id.remove(id);
                        }
                    }
                }
                ServiceRef::Name(name) => {
                    if let Some(list) = self.waiting_by_name.get_mut(name) {
                        list.retain(|h| *h != handle);
                        if list.is_empty() {
                            self.waiting_by_name.remove(name);
                        }
                    }
                }
            },
            _ => {}
        }

        self.posts.remove_for_owner(item.app_stream_id);
    }

    /// Копия сообщения запросу приложения под его stream id.
    pub(crate) fn deliver_to_request(
        &mut self,
        handle: Handle,
        msg: &Msg,
        seq_num: Option<SeqNum>,
        ft_group_id: Option<u8>,
        out: &mut Vec<WatchlistEvent>,
    ) {
        let Some(item) = self.requests.get_mut(handle) else {
            return;
        };

        let mut msg = msg.clone();
        msg.set_stream_id(item.app_stream_id);
        if let Some(state) = msg.state() {
            item.suspect_notified = state.data_state == DataState::Suspect;
        }

        out.push(WatchlistEvent::Msg {
            info: item.info(),
            msg,
            seq_num,
            ft_group_id,
        });
    }

    /// Убирает поток провайдера: очереди ожидания, таблица атрибутов,
    /// реестр, буфер. Запросы остаются в возвращённом потоке.
    pub(crate) fn teardown_stream(
        &mut self,
        stream_id: StreamId,
        action: CloseAction,
        out: &mut Vec<WatchlistEvent>,
    ) -> Option<ItemStream> {
        let mut stream = self.streams.remove(&stream_id)?;

        self.registry.unset_from_all_pending_lists(stream_id);
        if !stream.private {
            self.attributes.remove(&stream.attributes.msg_key, stream_id);
        }

        match action {
            CloseAction::OnDispatch if stream.requested => {
                self.registry.mark_closing(stream_id);
            }
            CloseAction::Now if stream.requested => {
                self.registry.remove(stream_id);
                out.push(WatchlistEvent::Send(
                    CloseMsg::new(stream_id, stream.domain_type()).into(),
                ));
            }
            _ => {
                self.registry.remove(stream_id);
            }
        }

        stream.queue.discard_all();
        self.remove_gap_stream(stream_id);
        if let Some(ft_group_id) = stream.ft_group.take() {
            self.ft_groups.remove_stream(ft_group_id, stream_id);
        }
        debug!("stream {stream_id} ({}) released", stream.attributes.msg_key);
        Some(stream)
    }

    // --- таймеры ---

    fn request_timed_out(&mut self, stream_id: StreamId, out: &mut Vec<WatchlistEvent>) {
        if stream_id == LOGIN_STREAM_ID || stream_id == DIRECTORY_STREAM_ID {
            warn!("no response on stream {stream_id}, requesting again");
            self.registry.set_pending_request(stream_id);
            return;
        }

        let Some(mut stream) = self.teardown_stream(stream_id, CloseAction::Now, out) else {
            self.registry.remove(stream_id);
            return;
        };

        warn!(
            "request on stream {stream_id} ({}) timed out",
            stream.attributes.msg_key
        );
        for handle in stream.take_requests() {
            if let Some(item) = self.requests.get(handle) {
                let mut status = StatusMsg::new(
                    item.app_stream_id,
                    item.domain_type,
                    Some(State::new(
                        StreamState::Closed,
                        DataState::Suspect,
                        StatusCode::UsageError,
                        "Request timed out.",
                    )),
                );
                status.key = Some(item.key.clone());
                out.push(WatchlistEvent::RequestTimeout {
                    info: item.info(),
                    status,
                });
            }
            self.destroy_request(handle);
        }
    }

    fn post_timed_out(&mut self, record: PostRecord, out: &mut Vec<WatchlistEvent>) {
        let Some(info) = self.owner_info(record.owner) else {
            return;
        };

        let mut ack = AckMsg::new(record.owner, record.domain_type, record.post_id);
        ack.seq_num = record.seq_num;
        ack.nak_code = Some(NakCode::NoResponse);
        ack.text = Some("Acknowledgement timed out.".to_string());
        if record.service_id.is_some() || record.name.is_some() {
            ack.key = Some(MsgKey {
                service_id: record.service_id,
                name: record.name,
                ..MsgKey::default()
            });
        }

        warn!(
            "post {} on stream {} was not acknowledged",
            record.post_id, record.owner
        );
        out.push(WatchlistEvent::PostTimeout { info, ack });
    }
}

/// Подменяет состояние потока в refresh или status.
pub(crate) fn override_state(msg: &mut Msg, stream_state: StreamState, data_state: DataState) {
    match msg {
        Msg::Refresh(refresh) => {
            refresh.state.stream_state = stream_state;
            refresh.state.data_state = data_state;
        }
        Msg::Status(status) => match &mut status.state {
            Some(state) => {
                state.stream_state = stream_state;
                state.data_state = data_state;
            }
            None => {
                status.state = Some(State::new(stream_state, data_state, StatusCode::None, ""));
            }
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use rwf_core::{MapAction, ServiceEntry};

    fn service_state(service_id: u16, up: bool) -> ServiceEntry {
        ServiceEntry {
            action: MapAction::Update,
            service_id,
            name: None,
            up: Some(up),
            accepting_requests: None,
            qos: Vec::new(),
            open_window: None,
        }
    }

    #[test]
    fn login_then_directory_makes_channel_ready() {
        init_logger();
        let mut wl = Watchlist::new(WatchlistConfig::default()).unwrap();
        wl.channel_up().unwrap();
        wl.submit_request(login_request(), RequestOptions::default())
            .unwrap();

        let events = wl.dispatch(0).unwrap();
        let out = sent(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream_id(), LOGIN_STREAM_ID);
        assert_eq!(out[0].domain_type(), DomainType::LOGIN);
        assert!(events.contains(&WatchlistEvent::ChannelState(ChannelState::LoginRequested)));
        assert!(wl.is_pending_response(LOGIN_STREAM_ID));

        let events = wl.read_msg(login_refresh(), 10).unwrap();
        let login = delivered(&events, APP_LOGIN_ID);
        assert_eq!(login.len(), 1);
        assert!(matches!(login[0], Msg::Refresh(_)));
        assert!(events.contains(&WatchlistEvent::ChannelState(ChannelState::LoggedIn)));
        assert!(!wl.is_pending_response(LOGIN_STREAM_ID));

        let events = wl.dispatch(10).unwrap();
        let out = sent(&events);
        assert_eq!(out.len(), 1);
        match out[0] {
            Msg::Request(request) => {
                assert_eq!(request.stream_id, DIRECTORY_STREAM_ID);
                assert_eq!(request.domain_type, DomainType::SOURCE);
                assert_eq!(request.key.filter, Some(DIRECTORY_FILTER));
            }
            other => panic!("expected directory request, got {other}"),
        }

        let events = wl
            .read_msg(
                directory_refresh(vec![ServiceEntry::up(SERVICE_ID, SERVICE_NAME)]),
                20,
            )
            .unwrap();
        assert!(events.contains(&WatchlistEvent::ChannelState(ChannelState::Ready)));
        assert_eq!(wl.channel_state(), ChannelState::Ready);
        assert!(wl.services().by_name(SERVICE_NAME).is_some());
    }

    #[test]
    fn broadcast_refresh_reaches_requesting_stream() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 3, "TRI", 0);

        let inbound = InboundMsg::new(refresh(0, "TRI")).with_seq_num(1);
        let events = wl.read_msg(inbound, 5).unwrap();

        let got = delivered_with_seq(&events, 3);
        assert_eq!(got.len(), 1);
        let (msg, seq_num) = got[0];
        assert!(matches!(msg, Msg::Refresh(_)));
        assert_eq!(msg.stream_id(), 3);
        assert_eq!(seq_num, Some(1));
        assert!(!wl.is_pending_response(wire));
    }

    #[test]
    fn identical_requests_share_one_stream() {
        let mut wl = ready(WatchlistConfig::default());
        wl.submit_request(item_request(5, "TRI"), RequestOptions::default())
            .unwrap();
        wl.submit_request(item_request(6, "TRI"), RequestOptions::default())
            .unwrap();

        let events = wl.dispatch(0).unwrap();
        let requests: Vec<_> = sent(&events)
            .into_iter()
            .filter(|m| matches!(m, Msg::Request(_)))
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(wl.item_stream_count(), 1);

        let wire = wl.wire_stream_id(5).unwrap();
        assert_eq!(wl.wire_stream_id(6), Some(wire));

        let events = wl.read_msg(InboundMsg::new(refresh(wire, "TRI")), 5).unwrap();
        assert_eq!(delivered(&events, 5).len(), 1);
        assert_eq!(delivered(&events, 6).len(), 1);
        assert_eq!(delivered(&events, 6)[0].stream_id(), 6);
    }

    #[test]
    fn request_timeout_closes_stream() {
        let config = WatchlistConfig {
            request_timeout_ms: 1_000,
            ..WatchlistConfig::default()
        };
        let mut wl = ready(config);
        let wire = open_item(&mut wl, 5, "TRI", 0);
        assert!(wl.is_pending_response(wire));
        assert_eq!(wl.next_timeout(), Some(1_000));

        assert!(wl.process_timers(999).unwrap().is_empty());

        let events = wl.process_timers(1_000).unwrap();
        assert!(
            sent(&events)
                .iter()
                .any(|m| matches!(m, Msg::Close(c) if c.stream_id == wire))
        );

        let timeout = events
            .iter()
            .find_map(|e| match e {
                WatchlistEvent::RequestTimeout { info, status } => Some((info, status)),
                _ => None,
            })
            .unwrap();
        assert_eq!(timeout.0.stream_id, 5);
        let state = timeout.1.state.as_ref().unwrap();
        assert_eq!(state.stream_state, StreamState::Closed);
        assert_eq!(state.data_state, DataState::Suspect);
        assert_eq!(state.code, StatusCode::UsageError);
        assert_eq!(state.text, "Request timed out.");

        assert!(!wl.is_pending_request(wire));
        assert!(!wl.is_pending_response(wire));
        assert_eq!(wl.request_count(), 0);
        assert_eq!(wl.wire_stream_id(5), None);
    }

    #[test]
    fn silent_ft_group_recovers_its_streams() {
        let config = WatchlistConfig {
            ft_group_timeout_ms: 1_000,
            ..WatchlistConfig::default()
        };
        let mut wl = ready(config);
        let wire = open_item(&mut wl, 5, "TRI", 0);

        let unicast = InboundMsg::new(refresh(wire, "TRI"))
            .with_seq_num(10)
            .with_ft_group_id(3);
        wl.read_msg(unicast, 100).unwrap();
        assert_eq!(wl.ft_group_count(), 1);
        assert_eq!(wl.next_timeout(), Some(1_100));

        // broadcast и ping группы отодвигают срок
        let broadcast = InboundMsg::new(update(0, "TRI"))
            .with_seq_num(11)
            .with_ft_group_id(3);
        wl.read_msg(broadcast, 600).unwrap();
        assert_eq!(wl.next_timeout(), Some(1_600));
        assert_eq!(wl.process_ft_group_ping(3, 900), Some(1_900));
        assert_eq!(wl.process_ft_group_ping(4, 900), None);

        assert!(wl.process_timers(1_100).unwrap().is_empty());

        let events = wl.process_timers(1_900).unwrap();
        let status = delivered(&events, 5);
        assert_eq!(status.len(), 1);
        let state = state_of(status[0]);
        assert_eq!(state.stream_state, StreamState::Open);
        assert_eq!(state.data_state, DataState::Suspect);
        assert_eq!(state.code, StatusCode::Timeout);
        assert_eq!(state.text, "Fault-tolerant Group timeout.");
        assert_eq!(wl.ft_group_count(), 0);
        assert_eq!(wl.next_timeout(), None);

        let events = wl.dispatch(1_900).unwrap();
        let msgs = sent(&events);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Msg::Close(c) if c.stream_id == wire)));
        let new_wire = wl.wire_stream_id(5).unwrap();
        assert_ne!(new_wire, wire);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Msg::Request(r) if r.stream_id == new_wire)));
    }

    #[test]
    fn closed_stream_leaves_its_ft_group() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 5, "TRI", 0);
        let unicast = InboundMsg::new(refresh(wire, "TRI")).with_ft_group_id(3);
        wl.read_msg(unicast, 0).unwrap();
        assert_eq!(wl.ft_group_count(), 1);

        wl.close_request(5).unwrap();
        assert_eq!(wl.ft_group_count(), 0);
        assert_eq!(wl.process_ft_group_ping(3, 10), None);
    }

    #[test]
    fn closing_last_request_sends_close_on_dispatch() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 5, "TRI", 0);
        open_item(&mut wl, 6, "TRI", 0);
        wl.read_msg(InboundMsg::new(refresh(wire, "TRI")), 0).unwrap();

        assert!(wl.close_request(5).unwrap().is_empty());
        assert_eq!(wl.item_stream_count(), 1);

        assert!(wl.close_request(6).unwrap().is_empty());
        assert_eq!(wl.item_stream_count(), 0);

        let events = wl.dispatch(10).unwrap();
        let out = sent(&events);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Msg::Close(c) if c.stream_id == wire));
        assert_eq!(wl.open_stream_count(), 2);

        assert!(matches!(
            wl.close_request(5),
            Err(WatchlistError::UnknownStream(5))
        ));
    }

    #[test]
    fn reissue_with_different_key_is_rejected() {
        let mut wl = ready(WatchlistConfig::default());
        open_item(&mut wl, 5, "TRI", 0);

        let err = wl
            .submit_request(item_request(5, "IBM"), RequestOptions::default())
            .unwrap_err();
        assert!(matches!(err, WatchlistError::KeyMismatchOnReissue(5)));
    }

    #[test]
    fn reissue_of_open_request_asks_for_new_refresh() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 5, "TRI", 0);
        wl.read_msg(InboundMsg::new(refresh(wire, "TRI")), 0).unwrap();
        assert!(!wl.is_pending_request(wire));

        wl.submit_request(item_request(5, "TRI"), RequestOptions::default())
            .unwrap();
        assert!(wl.is_pending_request(wire));

        let events = wl.dispatch(10).unwrap();
        assert!(matches!(sent(&events)[..], [Msg::Request(r)] if r.stream_id == wire));
    }

    #[test]
    fn stream_pool_exhaustion_closes_request() {
        let config = WatchlistConfig {
            stream_pool_count: 1,
            ..WatchlistConfig::default()
        };
        let mut wl = ready(config);
        wl.submit_request(item_request(5, "TRI"), RequestOptions::default())
            .unwrap();
        wl.submit_request(item_request(6, "IBM"), RequestOptions::default())
            .unwrap();

        let events = wl.dispatch(0).unwrap();
        let status = delivered(&events, 6);
        assert_eq!(status.len(), 1);
        let state = state_of(status[0]);
        assert_eq!(state.stream_state, StreamState::Closed);
        assert_eq!(state.code, StatusCode::UsageError);
        assert_eq!(state.text, "Too many streams.");

        assert_eq!(wl.request_count(), 1);
        assert!(wl.wire_stream_id(5).is_some());
    }

    #[test]
    fn closed_stream_slot_is_reused_before_close_is_sent() {
        let config = WatchlistConfig {
            stream_pool_count: 1,
            ..WatchlistConfig::default()
        };
        let mut wl = ready(config);
        wl.submit_request(item_request(5, "TRI"), RequestOptions::default())
            .unwrap();
        wl.dispatch(0).unwrap();
        let old_wire = wl.wire_stream_id(5).unwrap();

        wl.close_request(5).unwrap();
        wl.submit_request(item_request(6, "IBM"), RequestOptions::default())
            .unwrap();

        let events = wl.dispatch(10).unwrap();
        assert!(delivered(&events, 6).is_empty());
        let new_wire = wl.wire_stream_id(6).unwrap();
        assert_ne!(new_wire, old_wire);

        let msgs = sent(&events);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Msg::Request(r) if r.stream_id == new_wire)));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Msg::Close(c) if c.stream_id == old_wire)));
    }

    #[test]
    fn request_waits_for_its_service() {
        let mut wl = ready(WatchlistConfig::default());
        let mut request = item_request(5, "TRI");
        request.key.service_id = Some(9);
        wl.submit_request(request, RequestOptions::default()).unwrap();

        let events = wl.dispatch(0).unwrap();
        assert!(sent(&events).is_empty());
        let status = delivered(&events, 5);
        assert_eq!(status.len(), 1);
        let state = state_of(status[0]);
        assert_eq!(state.stream_state, StreamState::Open);
        assert_eq!(state.data_state, DataState::Suspect);
        assert_eq!(state.text, "No matching service present.");

        wl.read_msg(directory_update(vec![ServiceEntry::up(9, "OTHER")]), 5)
            .unwrap();
        let events = wl.dispatch(10).unwrap();
        assert!(
            matches!(sent(&events)[..], [Msg::Request(r)] if r.key.service_id == Some(9))
        );
    }

    #[test]
    fn request_by_service_name() {
        let mut wl = ready(WatchlistConfig::default());
        let mut request = item_request(5, "TRI");
        request.key.service_id = None;
        let options = RequestOptions {
            user_spec: Some(42),
            service_name: Some(SERVICE_NAME.to_string()),
        };
        wl.submit_request(request, options).unwrap();

        let events = wl.dispatch(0).unwrap();
        assert!(
            matches!(sent(&events)[..], [Msg::Request(r)] if r.key.service_id == Some(SERVICE_ID))
        );

        let wire = wl.wire_stream_id(5).unwrap();
        let events = wl.read_msg(InboundMsg::new(refresh(wire, "TRI")), 5).unwrap();
        assert!(matches!(
            &events[..],
            [WatchlistEvent::Msg { info, .. }] if info.user_spec == Some(42)
        ));
    }

    #[test]
    fn request_without_service_is_rejected() {
        let mut wl = ready(WatchlistConfig::default());
        let mut request = item_request(5, "TRI");
        request.key.service_id = None;

        let err = wl
            .submit_request(request, RequestOptions::default())
            .unwrap_err();
        assert!(matches!(err, WatchlistError::MissingService(5)));
    }

    #[test]
    fn service_down_recovers_streams() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 5, "TRI", 0);
        wl.read_msg(InboundMsg::new(refresh(wire, "TRI")), 0).unwrap();

        let events = wl
            .read_msg(directory_update(vec![service_state(SERVICE_ID, false)]), 10)
            .unwrap();
        let status = delivered(&events, 5);
        assert_eq!(status.len(), 1);
        let state = state_of(status[0]);
        assert_eq!(state.stream_state, StreamState::Open);
        assert_eq!(state.data_state, DataState::Suspect);
        assert_eq!(state.text, "Service is down.");
        // провайдер сам закрыл потоки сервиса
        assert!(sent(&events).is_empty());
        assert_eq!(wl.item_stream_count(), 0);

        // Приложение уже знает о SUSPECT: второй статус не нужен
        let events = wl.dispatch(20).unwrap();
        assert!(events.is_empty());

        wl.read_msg(directory_update(vec![service_state(SERVICE_ID, true)]), 30)
            .unwrap();
        let events = wl.dispatch(40).unwrap();
        assert!(matches!(sent(&events)[..], [Msg::Request(_)]));
        assert_eq!(wl.item_stream_count(), 1);
    }

    #[test]
    fn post_ack_goes_to_posting_request() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 5, "TRI", 0);

        let mut post = PostMsg::new(5, DomainType::MARKET_PRICE);
        post.post_id = Some(7);
        post.ack = true;
        let events = wl.submit_post(post, 0).unwrap();
        assert!(matches!(sent(&events)[..], [Msg::Post(p)] if p.stream_id == wire));
        assert_eq!(wl.outstanding_posts(), 1);

        let ack = AckMsg::new(wire, DomainType::MARKET_PRICE, 7);
        let events = wl.read_msg(InboundMsg::new(ack), 10).unwrap();
        assert!(matches!(
            delivered(&events, 5)[..],
            [Msg::Ack(a)] if a.ack_id == 7 && a.stream_id == 5
        ));
        assert_eq!(wl.outstanding_posts(), 0);
    }

    #[test]
    fn unacknowledged_post_times_out() {
        let config = WatchlistConfig {
            post_ack_timeout_ms: 500,
            ..WatchlistConfig::default()
        };
        let mut wl = ready(config);
        open_item(&mut wl, 5, "TRI", 0);

        let mut post = PostMsg::new(5, DomainType::MARKET_PRICE);
        post.post_id = Some(7);
        post.ack = true;
        post.key = Some(MsgKey::named(SERVICE_ID, "TRI"));
        wl.submit_post(post.clone(), 100).unwrap();

        let err = wl.submit_post(post, 100).unwrap_err();
        assert!(matches!(
            err,
            WatchlistError::Post(crate::error::PostError::Duplicate { post_id: 7 })
        ));

        assert!(wl.process_timers(599).unwrap().is_empty());
        let events = wl.process_timers(600).unwrap();
        match &events[..] {
            [WatchlistEvent::PostTimeout { info, ack }] => {
                assert_eq!(info.stream_id, 5);
                assert_eq!(ack.ack_id, 7);
                assert_eq!(ack.nak_code, Some(NakCode::NoResponse));
                assert_eq!(
                    ack.key.as_ref().and_then(|k| k.name.as_deref()),
                    Some("TRI")
                );
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(wl.outstanding_posts(), 0);
    }

    #[test]
    fn post_on_unsent_stream_is_rejected() {
        let mut wl = ready(WatchlistConfig::default());
        wl.submit_request(item_request(5, "TRI"), RequestOptions::default())
            .unwrap();

        let post = PostMsg::new(5, DomainType::MARKET_PRICE);
        assert!(matches!(
            wl.submit_post(post, 0),
            Err(WatchlistError::StreamNotOpen(5))
        ));
    }

    #[test]
    fn channel_down_recovers_requests() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 5, "TRI", 0);
        wl.read_msg(InboundMsg::new(refresh(wire, "TRI")), 0).unwrap();

        let events = wl.channel_down("Channel is down.");
        let item = delivered(&events, 5);
        assert_eq!(item.len(), 1);
        assert_eq!(state_of(item[0]).stream_state, StreamState::Open);
        assert_eq!(state_of(item[0]).data_state, DataState::Suspect);
        assert_eq!(state_of(item[0]).text, "Channel is down.");
        assert_eq!(delivered(&events, APP_LOGIN_ID).len(), 1);
        assert!(events.contains(&WatchlistEvent::ChannelState(ChannelState::Start)));

        assert_eq!(wl.item_stream_count(), 0);
        assert_eq!(wl.open_stream_count(), 0);
        assert_eq!(wl.request_count(), 1);

        wl.channel_up().unwrap();
        wl.dispatch(100).unwrap();
        wl.read_msg(login_refresh(), 100).unwrap();
        wl.dispatch(100).unwrap();
        wl.read_msg(
            directory_refresh(vec![ServiceEntry::up(SERVICE_ID, SERVICE_NAME)]),
            100,
        )
        .unwrap();

        let events = wl.dispatch(110).unwrap();
        assert!(matches!(sent(&events)[..], [Msg::Request(_)]));
        assert!(wl.wire_stream_id(5).is_some());
    }

    #[test]
    fn closed_status_on_unknown_stream_is_answered_with_close() {
        let mut wl = ready(WatchlistConfig::default());
        let status = StatusMsg::new(
            42,
            DomainType::MARKET_PRICE,
            Some(State::new(
                StreamState::Closed,
                DataState::Suspect,
                StatusCode::None,
                "",
            )),
        );

        assert!(wl.read_msg(InboundMsg::new(status), 0).unwrap().is_empty());

        let events = wl.dispatch(0).unwrap();
        assert!(matches!(sent(&events)[..], [Msg::Close(c)] if c.stream_id == 42));
        assert_eq!(wl.open_stream_count(), 2);
    }

    #[test]
    fn directory_request_is_served_from_cache() {
        let mut wl = ready(WatchlistConfig::default());
        let request = RequestMsg::new(10, DomainType::SOURCE, MsgKey::default());

        let events = wl.submit_request(request, RequestOptions::default()).unwrap();
        match delivered(&events, 10)[..] {
            [Msg::Refresh(refresh)] => match &refresh.payload {
                Payload::Directory(entries) => {
                    assert_eq!(entries.len(), 1);
                    assert_eq!(entries[0].service_id, SERVICE_ID);
                }
                other => panic!("unexpected payload: {other:?}"),
            },
            ref other => panic!("unexpected events: {other:?}"),
        }

        // streaming-запрос получает и последующие изменения
        let events = wl
            .read_msg(directory_update(vec![ServiceEntry::up(9, "OTHER")]), 10)
            .unwrap();
        assert_eq!(delivered(&events, 10).len(), 1);
    }

    #[test]
    fn login_closed_by_provider_closes_everything() {
        let mut wl = ready(WatchlistConfig::default());
        open_item(&mut wl, 5, "TRI", 0);

        let status = StatusMsg::new(
            LOGIN_STREAM_ID,
            DomainType::LOGIN,
            Some(State::new(
                StreamState::Closed,
                DataState::Suspect,
                StatusCode::NotEntitled,
                "denied",
            )),
        );
        let events = wl.read_msg(InboundMsg::new(status), 10).unwrap();

        assert_eq!(delivered(&events, APP_LOGIN_ID).len(), 1);
        let item = delivered(&events, 5);
        assert_eq!(item.len(), 1);
        assert_eq!(state_of(item[0]).stream_state, StreamState::Closed);
        assert_eq!(state_of(item[0]).text, "Login stream was closed.");
        assert!(events.contains(&WatchlistEvent::ChannelState(ChannelState::Closed)));

        assert!(matches!(
            wl.submit_request(item_request(6, "IBM"), RequestOptions::default()),
            Err(WatchlistError::ChannelClosed)
        ));
    }

    #[test]
    fn login_closed_recover_starts_over() {
        let mut wl = ready(WatchlistConfig::default());
        let wire = open_item(&mut wl, 5, "TRI", 0);
        wl.read_msg(InboundMsg::new(refresh(wire, "TRI")), 0).unwrap();

        let status = StatusMsg::new(
            LOGIN_STREAM_ID,
            DomainType::LOGIN,
            Some(State::new(
                StreamState::ClosedRecover,
                DataState::Suspect,
                StatusCode::None,
                "try again",
            )),
        );
        let events = wl.read_msg(InboundMsg::new(status), 10).unwrap();

        let login = delivered(&events, APP_LOGIN_ID);
        assert_eq!(login.len(), 1);
        assert_eq!(state_of(login[0]).stream_state, StreamState::Open);
        assert_eq!(state_of(delivered(&events, 5)[0]).text, "try again");
        assert_eq!(wl.channel_state(), ChannelState::Start);

        let events = wl.dispatch(20).unwrap();
        assert!(
            matches!(sent(&events)[..], [Msg::Request(r)] if r.stream_id == LOGIN_STREAM_ID)
        );
    }

    #[test]
    fn application_close_of_login_closes_channel() {
        let mut wl = ready(WatchlistConfig::default());
        open_item(&mut wl, 5, "TRI", 0);

        let events = wl.close_request(APP_LOGIN_ID).unwrap();
        assert!(matches!(sent(&events)[..], [Msg::Close(c)] if c.stream_id == LOGIN_STREAM_ID));
        assert_eq!(wl.channel_state(), ChannelState::Closed);
        assert_eq!(wl.request_count(), 0);
    }
}
