//! Cluster events: types, listener table and broadcast tap.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Listener`], [`ListenerId`] the synchronous handler contract
//! - `ListenerTable` ordered, panic-isolated dispatch (owned by the control loop)
//! - [`Bus`] broadcast copy of every dispatched event for async consumers
//!
//! ## Quick reference
//! - **Publisher**: only the control loop (`core::control`).
//! - **Consumers**: listeners registered with `on`/`once`/`on_any`, and
//!   receivers obtained from `Cluster::subscribe()`.

mod bus;
mod event;
mod listeners;
#[cfg(feature = "logging")]
mod log;

pub use bus::Bus;
pub use event::{Event, EventKind};
pub use listeners::{Listener, ListenerId};
pub(crate) use listeners::ListenerTable;
#[cfg(feature = "logging")]
pub use log::LogWriter;
