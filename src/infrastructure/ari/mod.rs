//! Asterisk REST Interface (ARI) adapter
//!
//! Commands go over HTTP, notifications arrive on the `/events` WebSocket
//! and are routed to subscriptions through an [`EventRouter`].
//!
//! [`EventRouter`]: crate::infrastructure::messaging::EventRouter

mod channel;
mod client;

pub use channel::AriChannel;
pub use client::{AriClient, AriSettings};
