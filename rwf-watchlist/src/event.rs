use std::fmt;

use rwf_core::{AckMsg, Msg, SeqNum, StatusMsg, StreamId};

/// Состояние сессии канала.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Start,
    LoginRequested,
    LoggedIn,
    Ready,
    /// Терминальное: login или directory закрыты
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Start => "START",
            ChannelState::LoginRequested => "LOGIN_REQUESTED",
            ChannelState::LoggedIn => "LOGGED_IN",
            ChannelState::Ready => "READY",
            ChannelState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Какому запросу приложения адресовано событие.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream id, под которым приложение открыло запрос
    pub stream_id: StreamId,
    /// Непрозрачное значение, переданное приложением вместе с запросом
    pub user_spec: Option<u64>,
}

/// Сообщение из транспорта вместе с multicast-метаданными.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMsg {
    pub msg: Msg,
    pub seq_num: Option<SeqNum>,
    pub ft_group_id: Option<u8>,
}

impl InboundMsg {
    pub fn new(msg: impl Into<Msg>) -> Self {
        Self {
            msg: msg.into(),
            seq_num: None,
            ft_group_id: None,
        }
    }

    pub fn with_seq_num(mut self, seq_num: SeqNum) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    pub fn with_ft_group_id(mut self, ft_group_id: u8) -> Self {
        self.ft_group_id = Some(ft_group_id);
        self
    }
}

/// Результат работы watchlist'а за один вызов.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchlistEvent {
    /// Отправить в канал (кодирует вызывающий)
    Send(Msg),
    /// Доставить сообщение запросу приложения
    Msg {
        info: StreamInfo,
        msg: Msg,
        seq_num: Option<SeqNum>,
        ft_group_id: Option<u8>,
    },
    /// Запрос не дождался ответа и закрыт
    RequestTimeout { info: StreamInfo, status: StatusMsg },
    /// Post не дождался подтверждения
    PostTimeout { info: StreamInfo, ack: AckMsg },
    ChannelState(ChannelState),
}

impl WatchlistEvent {
    pub(crate) fn deliver(info: StreamInfo, msg: Msg) -> Self {
        WatchlistEvent::Msg {
            info,
            msg,
            seq_num: None,
            ft_group_id: None,
        }
    }
}
