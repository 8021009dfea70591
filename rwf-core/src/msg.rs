use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rdm::ServiceEntry;
use crate::types::{DomainType, MsgKey, NakCode, Qos, SeqNum, State, StreamId};

/// Класс сообщения (для логов и маршрутизации).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgClass {
    Request,
    Refresh,
    Update,
    Status,
    Close,
    Ack,
    Post,
    Generic,
}

impl fmt::Display for MsgClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Полезная нагрузка. Кодек RWF внешний, поэтому здесь либо непрозрачные байты,
/// либо уже декодированный directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    None,
    Opaque(Vec<u8>),
    Directory(Vec<ServiceEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    pub key: MsgKey,
    pub qos: Option<Qos>,
    pub streaming: bool,
    pub private_stream: bool,
}

impl RequestMsg {
    /// Streaming-запрос без QoS.
    pub fn new(stream_id: StreamId, domain_type: DomainType, key: MsgKey) -> Self {
        Self {
            stream_id,
            domain_type,
            key,
            qos: None,
            streaming: true,
            private_stream: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    pub key: Option<MsgKey>,
    pub qos: Option<Qos>,
    pub state: State,
    pub solicited: bool,
    pub complete: bool,
    pub clear_cache: bool,
    pub part_num: Option<u16>,
    pub seq_num: Option<SeqNum>,
    pub payload: Payload,
}

impl RefreshMsg {
    /// Полный (complete) solicited refresh.
    pub fn new(stream_id: StreamId, domain_type: DomainType, state: State) -> Self {
        Self {
            stream_id,
            domain_type,
            key: None,
            qos: None,
            state,
            solicited: true,
            complete: true,
            clear_cache: true,
            part_num: None,
            seq_num: None,
            payload: Payload::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    pub key: Option<MsgKey>,
    pub seq_num: Option<SeqNum>,
    pub payload: Payload,
}

impl UpdateMsg {
    pub fn new(stream_id: StreamId, domain_type: DomainType) -> Self {
        Self {
            stream_id,
            domain_type,
            key: None,
            seq_num: None,
            payload: Payload::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    pub key: Option<MsgKey>,
    pub state: Option<State>,
    pub clear_cache: bool,
}

impl StatusMsg {
    pub fn new(stream_id: StreamId, domain_type: DomainType, state: Option<State>) -> Self {
        Self {
            stream_id,
            domain_type,
            key: None,
            state,
            clear_cache: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
}

impl CloseMsg {
    pub fn new(stream_id: StreamId, domain_type: DomainType) -> Self {
        Self {
            stream_id,
            domain_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    /// Совпадает с Post ID подтверждаемого сообщения
    pub ack_id: u32,
    pub seq_num: Option<SeqNum>,
    pub nak_code: Option<NakCode>,
    pub text: Option<String>,
    pub key: Option<MsgKey>,
}

impl AckMsg {
    /// Положительное подтверждение
    pub fn new(stream_id: StreamId, domain_type: DomainType, ack_id: u32) -> Self {
        Self {
            stream_id,
            domain_type,
            ack_id,
            seq_num: None,
            nak_code: None,
            text: None,
            key: None,
        }
    }

    pub fn is_nak(&self) -> bool {
        self.nak_code.is_some_and(|c| c != NakCode::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    pub post_id: Option<u32>,
    pub seq_num: Option<SeqNum>,
    /// Запрошено подтверждение (AckMsg)
    pub ack: bool,
    /// Последняя часть многочастного post
    pub complete: bool,
    pub key: Option<MsgKey>,
    pub payload: Payload,
}

impl PostMsg {
    /// Одночастный post без запроса подтверждения.
    pub fn new(stream_id: StreamId, domain_type: DomainType) -> Self {
        Self {
            stream_id,
            domain_type,
            post_id: None,
            seq_num: None,
            ack: false,
            complete: true,
            key: None,
            payload: Payload::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMsg {
    pub stream_id: StreamId,
    pub domain_type: DomainType,
    pub key: Option<MsgKey>,
    pub seq_num: Option<SeqNum>,
    pub payload: Payload,
}

/// Декодированное сообщение: то, чем обмениваются кодек, watchlist и приложение.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    Request(RequestMsg),
    Refresh(RefreshMsg),
    Update(UpdateMsg),
    Status(StatusMsg),
    Close(CloseMsg),
    Ack(AckMsg),
    Post(PostMsg),
    Generic(GenericMsg),
}

impl Msg {
    pub fn class(&self) -> MsgClass {
        match self {
            Msg::Request(_) => MsgClass::Request,
            Msg::Refresh(_) => MsgClass::Refresh,
            Msg::Update(_) => MsgClass::Update,
            Msg::Status(_) => MsgClass::Status,
            Msg::Close(_) => MsgClass::Close,
            Msg::Ack(_) => MsgClass::Ack,
            Msg::Post(_) => MsgClass::Post,
            Msg::Generic(_) => MsgClass::Generic,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Msg::Request(m) => m.stream_id,
            Msg::Refresh(m) => m.stream_id,
            Msg::Update(m) => m.stream_id,
            Msg::Status(m) => m.stream_id,
            Msg::Close(m) => m.stream_id,
            Msg::Ack(m) => m.stream_id,
            Msg::Post(m) => m.stream_id,
            Msg::Generic(m) => m.stream_id,
        }
    }

    /// Подмена stream id (wire id <-> id приложения).
    pub fn set_stream_id(&mut self, stream_id: StreamId) {
        match self {
            Msg::Request(m) => m.stream_id = stream_id,
            Msg::Refresh(m) => m.stream_id = stream_id,
            Msg::Update(m) => m.stream_id = stream_id,
            Msg::Status(m) => m.stream_id = stream_id,
            Msg::Close(m) => m.stream_id = stream_id,
            Msg::Ack(m) => m.stream_id = stream_id,
            Msg::Post(m) => m.stream_id = stream_id,
            Msg::Generic(m) => m.stream_id = stream_id,
        }
    }

    pub fn domain_type(&self) -> DomainType {
        match self {
            Msg::Request(m) => m.domain_type,
            Msg::Refresh(m) => m.domain_type,
            Msg::Update(m) => m.domain_type,
            Msg::Status(m) => m.domain_type,
            Msg::Close(m) => m.domain_type,
            Msg::Ack(m) => m.domain_type,
            Msg::Post(m) => m.domain_type,
            Msg::Generic(m) => m.domain_type,
        }
    }

    pub fn key(&self) -> Option<&MsgKey> {
        match self {
            Msg::Request(m) => Some(&m.key),
            Msg::Refresh(m) => m.key.as_ref(),
            Msg::Update(m) => m.key.as_ref(),
            Msg::Status(m) => m.key.as_ref(),
            Msg::Close(_) => None,
            Msg::Ack(m) => m.key.as_ref(),
            Msg::Post(m) => m.key.as_ref(),
            Msg::Generic(m) => m.key.as_ref(),
        }
    }

    /// Состояние потока, если сообщение его несёт.
    pub fn state(&self) -> Option<&State> {
        match self {
            Msg::Refresh(m) => Some(&m.state),
            Msg::Status(m) => m.state.as_ref(),
            _ => None,
        }
    }

    /// Является ли сообщение broadcast (multicast без stream id).
    pub fn is_broadcast(&self) -> bool {
        self.stream_id() == 0
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} domain={}",
            self.class(),
            self.stream_id(),
            self.domain_type()
        )
    }
}

impl From<RequestMsg> for Msg {
    fn from(m: RequestMsg) -> Self {
        Msg::Request(m)
    }
}

impl From<RefreshMsg> for Msg {
    fn from(m: RefreshMsg) -> Self {
        Msg::Refresh(m)
    }
}

impl From<UpdateMsg> for Msg {
    fn from(m: UpdateMsg) -> Self {
        Msg::Update(m)
    }
}

impl From<StatusMsg> for Msg {
    fn from(m: StatusMsg) -> Self {
        Msg::Status(m)
    }
}

impl From<CloseMsg> for Msg {
    fn from(m: CloseMsg) -> Self {
        Msg::Close(m)
    }
}

impl From<AckMsg> for Msg {
    fn from(m: AckMsg) -> Self {
        Msg::Ack(m)
    }
}

impl From<PostMsg> for Msg {
    fn from(m: PostMsg) -> Self {
        Msg::Post(m)
    }
}

impl From<GenericMsg> for Msg {
    fn from(m: GenericMsg) -> Self {
        Msg::Generic(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataState, StreamState};

    #[test]
    fn set_stream_id_rewrites_every_class() {
        let mut msgs: Vec<Msg> = vec![
            RequestMsg::new(5, DomainType::MARKET_PRICE, MsgKey::named(1, "TRI")).into(),
            RefreshMsg::new(5, DomainType::MARKET_PRICE, State::open_ok()).into(),
            UpdateMsg::new(5, DomainType::MARKET_PRICE).into(),
            StatusMsg::new(5, DomainType::MARKET_PRICE, None).into(),
            CloseMsg::new(5, DomainType::MARKET_PRICE).into(),
            AckMsg::new(5, DomainType::MARKET_PRICE, 1).into(),
            PostMsg::new(5, DomainType::MARKET_PRICE).into(),
        ];

        for m in msgs.iter_mut() {
            m.set_stream_id(42);
            assert_eq!(m.stream_id(), 42, "{m}");
        }
    }

    #[test]
    fn state_only_on_refresh_and_status() {
        let closed = State::new(
            StreamState::Closed,
            DataState::Suspect,
            crate::types::StatusCode::None,
            "gone",
        );
        let status: Msg = StatusMsg::new(3, DomainType::MARKET_PRICE, Some(closed.clone())).into();
        assert_eq!(status.state(), Some(&closed));

        let update: Msg = UpdateMsg::new(3, DomainType::MARKET_PRICE).into();
        assert!(update.state().is_none());
    }

    #[test]
    fn nak_detection() {
        let mut ack = AckMsg::new(3, DomainType::MARKET_PRICE, 7);
        assert!(!ack.is_nak());
        ack.nak_code = Some(NakCode::None);
        assert!(!ack.is_nak());
        ack.nak_code = Some(NakCode::NoResponse);
        assert!(ack.is_nak());
    }
}
