//! Заготовки для тестов: watchlist в состоянии READY и разбор событий.

use rwf_core::constants::{DIRECTORY_STREAM_ID, LOGIN_STREAM_ID};
use rwf_core::{
    DomainType, Msg, MsgKey, Payload, RefreshMsg, RequestMsg, SeqNum, ServiceEntry, State,
    StreamId, UpdateMsg,
};

use crate::event::{ChannelState, InboundMsg, WatchlistEvent};
use crate::{RequestOptions, Watchlist, WatchlistConfig};

pub(crate) const SERVICE_ID: u16 = 1;
pub(crate) const SERVICE_NAME: &str = "ELEKTRON";

/// Stream id, под которым приложение открывает login
pub(crate) const APP_LOGIN_ID: StreamId = 1;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn login_request() -> RequestMsg {
    let key = MsgKey {
        name: Some("user".to_string()),
        ..MsgKey::default()
    };
    RequestMsg::new(APP_LOGIN_ID, DomainType::LOGIN, key)
}

pub(crate) fn login_refresh() -> InboundMsg {
    InboundMsg::new(RefreshMsg::new(
        LOGIN_STREAM_ID,
        DomainType::LOGIN,
        State::open_ok(),
    ))
}

pub(crate) fn directory_refresh(entries: Vec<ServiceEntry>) -> InboundMsg {
    let mut refresh = RefreshMsg::new(DIRECTORY_STREAM_ID, DomainType::SOURCE, State::open_ok());
    refresh.payload = Payload::Directory(entries);
    InboundMsg::new(refresh)
}

pub(crate) fn directory_update(entries: Vec<ServiceEntry>) -> InboundMsg {
    let mut update = UpdateMsg::new(DIRECTORY_STREAM_ID, DomainType::SOURCE);
    update.payload = Payload::Directory(entries);
    InboundMsg::new(update)
}

/// Login и directory пройдены, сервис ELEKTRON (id 1) поднят.
pub(crate) fn ready(config: WatchlistConfig) -> Watchlist {
    init_logger();

    let mut wl = Watchlist::new(config).unwrap();
    wl.channel_up().unwrap();
    wl.submit_request(login_request(), RequestOptions::default())
        .unwrap();
    wl.dispatch(0).unwrap();
    wl.read_msg(login_refresh(), 0).unwrap();
    wl.dispatch(0).unwrap();
    wl.read_msg(
        directory_refresh(vec![ServiceEntry::up(SERVICE_ID, SERVICE_NAME)]),
        0,
    )
    .unwrap();

    assert_eq!(wl.channel_state(), ChannelState::Ready);
    wl
}

pub(crate) fn item_request(app_stream_id: StreamId, name: &str) -> RequestMsg {
    RequestMsg::new(
        app_stream_id,
        DomainType::MARKET_PRICE,
        MsgKey::named(SERVICE_ID, name),
    )
}

/// Открывает item-запрос и отправляет его. Возвращает wire stream id.
pub(crate) fn open_item(wl: &mut Watchlist, app_stream_id: StreamId, name: &str, now: u64) -> StreamId {
    wl.submit_request(item_request(app_stream_id, name), RequestOptions::default())
        .unwrap();
    wl.dispatch(now).unwrap();
    wl.wire_stream_id(app_stream_id).unwrap()
}

pub(crate) fn refresh(stream_id: StreamId, name: &str) -> RefreshMsg {
    let mut refresh = RefreshMsg::new(stream_id, DomainType::MARKET_PRICE, State::open_ok());
    refresh.key = Some(MsgKey::named(SERVICE_ID, name));
    refresh
}

pub(crate) fn update(stream_id: StreamId, name: &str) -> UpdateMsg {
    let mut update = UpdateMsg::new(stream_id, DomainType::MARKET_PRICE);
    update.key = Some(MsgKey::named(SERVICE_ID, name));
    update
}

/// Сообщения, которые watchlist просит отправить в канал.
pub(crate) fn sent(events: &[WatchlistEvent]) -> Vec<&Msg> {
    events
        .iter()
        .filter_map(|e| match e {
            WatchlistEvent::Send(msg) => Some(msg),
            _ => None,
        })
        .collect()
}

/// Сообщения, доставленные запросу `app_stream_id`.
pub(crate) fn delivered(events: &[WatchlistEvent], app_stream_id: StreamId) -> Vec<&Msg> {
    delivered_with_seq(events, app_stream_id)
        .into_iter()
        .map(|(msg, _)| msg)
        .collect()
}

pub(crate) fn delivered_with_seq(
    events: &[WatchlistEvent],
    app_stream_id: StreamId,
) -> Vec<(&Msg, Option<SeqNum>)> {
    events
        .iter()
        .filter_map(|e| match e {
            WatchlistEvent::Msg {
                info, msg, seq_num, ..
            } if info.stream_id == app_stream_id => Some((msg, *seq_num)),
            _ => None,
        })
        .collect()
}

pub(crate) fn state_of(msg: &Msg) -> &State {
    msg.state().unwrap()
}
