//! # rwf-core
//!
//! Базовые типы для watchlist и reactor.
//!
//! Этот крейт содержит:
//!
//! - [`msg`] — декодированные сообщения (`Request`, `Refresh`, `Update`, `Status`, `Close`, `Ack`, `Post`, `Generic`)
//! - [`types`] — ключи, QoS, состояния потоков, домены
//! - [`rdm`] — декодированный Source Directory
//! - [`seq`] — сравнение номеров последовательности с переполнением
//! - [`wire`] — компактный wire-формат кадров (версия + postcard payload)
//! - [`error`] — типы ошибок `rwf-core`
//!
//! ## Пример: сравнение номеров последовательности
//!
//! ```rust
//! use rwf_core::seq::{next_seq_num, seq_compare};
//!
//! assert!(seq_compare(u32::MAX, 1) < 0);
//! assert_eq!(next_seq_num(u32::MAX), 1);
//! ```
//!
//! ## Пример: wire-формат
//!
//! ```rust
//! use rwf_core::wire::{decode_frame, encode_frame, Frame};
//! use rwf_core::{DomainType, MsgKey, RequestMsg};
//!
//! let frame = Frame::unicast(RequestMsg::new(3, DomainType::MARKET_PRICE, MsgKey::named(1, "TRI")));
//!
//! let bytes = encode_frame(&frame).unwrap();
//! assert_eq!(decode_frame(&bytes).unwrap(), frame);
//! ```
//!
//! ## Дизайн
//!
//! Настоящий кодек RWF и транспорт — внешние компоненты. `rwf-core` держит
//! только то, что нужно ядру: чистые типы уже декодированных сообщений и
//! простой кадр для тестов и loopback-транспорта, без runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Декодированные сообщения.
pub mod msg;

/// Декодированный Source Directory.
pub mod rdm;

/// Номера последовательности.
pub mod seq;

/// Доменные типы.
pub mod types;

/// Wire-уровень (кадры канала).
pub mod wire;

/// Ошибки `rwf-core`.
pub mod error;

/// Общие константы
pub mod constants;
pub use constants::{PING_INTERVAL, PING_TIMEOUT};

// --- Re-exports (публичный фасад API) ---

pub use crate::error::WireError;
pub use crate::msg::{
    AckMsg, CloseMsg, GenericMsg, Msg, MsgClass, Payload, PostMsg, RefreshMsg, RequestMsg,
    StatusMsg, UpdateMsg,
};
pub use crate::rdm::{MapAction, ServiceEntry};
pub use crate::types::{
    DataState, DomainType, MsgKey, NakCode, Qos, Rate, SeqNum, State, StatusCode, StreamId,
    StreamState, Timeliness,
};
