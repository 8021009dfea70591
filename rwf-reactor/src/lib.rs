//! # rwf-reactor
//!
//! Цикл событий поверх [`rwf_watchlist::Watchlist`]: транспорт, кодирование
//! кадров, контроль живости канала и доставка событий приложению.
//!
//! - [`reactor`] — [`Reactor`]: каналы, `dispatch`, `run`, `reconnect`
//! - [`transport`] — трейт [`Transport`] и memory-транспорт на crossbeam
//! - [`ping`] — [`PingTracker`]
//! - [`event`] — [`ReactorEvent`] для приложения
//!
//! ## Пример
//!
//! ```rust
//! use std::time::Duration;
//! use rwf_reactor::{Reactor, ReactorConfig, ReactorEvent, memory_pair};
//!
//! let (client, _provider) = memory_pair();
//! let (mut reactor, events) = Reactor::new(ReactorConfig::default());
//! let id = reactor.add_channel(client.transport, client.inbound).unwrap();
//!
//! reactor.dispatch(Duration::from_millis(10)).unwrap();
//! assert_eq!(events.try_recv().unwrap(), ReactorEvent::ChannelUp(id));
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod ping;
pub mod reactor;
pub mod transport;

mod channel;

pub use crate::config::{ChannelId, ReactorConfig};
pub use crate::error::ReactorError;
pub use crate::event::ReactorEvent;
pub use crate::ping::PingTracker;
pub use crate::reactor::Reactor;
pub use crate::transport::{MemoryEnd, MemoryTransport, Transport, memory_pair};
