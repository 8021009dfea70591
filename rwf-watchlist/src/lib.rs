//! # rwf-watchlist
//!
//! Watchlist потребителя: одно соединение с провайдером, много запросов
//! приложения.
//!
//! Этот крейт содержит:
//!
//! - [`watchlist`] — [`Watchlist`]: login, directory, item-запросы, post, таймеры
//! - [`registry`] — реестр потоков провайдера и очереди "нужно отправить" / "ждём ответ"
//! - [`attributes`] — поиск потока по (домен, ключ, QoS) для схлопывания запросов
//! - [`reorder`] — буфер для восстановления порядка multicast-сообщений
//! - [`post_table`] — post-сообщения, ожидающие AckMsg
//! - [`directory`] — кэш сервисов из Source Directory
//! - [`config`] — настройки watchlist'а
//! - [`error`] — типы ошибок
//!
//! ## Пример
//!
//! ```rust
//! use rwf_core::{DomainType, MsgKey, RequestMsg};
//! use rwf_watchlist::{RequestOptions, Watchlist, WatchlistConfig, WatchlistEvent};
//!
//! let mut wl = Watchlist::new(WatchlistConfig::default()).unwrap();
//! wl.channel_up().unwrap();
//!
//! let login = RequestMsg::new(1, DomainType::LOGIN, MsgKey::default());
//! wl.submit_request(login, RequestOptions::default()).unwrap();
//!
//! let events = wl.dispatch(0).unwrap();
//! assert!(matches!(events[0], WatchlistEvent::Send(_)));
//! ```
//!
//! ## Дизайн
//!
//! Watchlist не делает ввода-вывода и не читает часы: время приходит
//! аргументом `now` (мс), а всё, что нужно отправить в канал или отдать
//! приложению, возвращается списком [`WatchlistEvent`]. Канал, кодек и цикл
//! событий живут в `rwf-reactor`.

#![forbid(unsafe_code)]

pub mod attributes;
pub mod config;
pub mod directory;
pub mod error;
pub mod event;
pub mod pool;
pub mod post_table;
pub mod registry;
pub mod reorder;
pub mod stream_id;
pub mod watchlist;

mod fanout;
mod ft_group;
mod item;
mod ordering;

#[cfg(test)]
mod testing;

// --- Re-exports ---

pub use crate::config::WatchlistConfig;
pub use crate::directory::{Service, ServiceCache, ServiceUpdate};
pub use crate::error::{ConfigError, PostError, WatchlistError};
pub use crate::event::{ChannelState, InboundMsg, StreamInfo, WatchlistEvent};
pub use crate::watchlist::{RequestOptions, Watchlist};
