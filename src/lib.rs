//! # Livewire
//!
//! Client-side realtime transport engine: one persistent websocket connection,
//! multiplexed across many independent data topics and many independent
//! consumers.
//!
//! The engine owns the connection lifecycle (connect, liveness probing,
//! reconnect with capped backoff, authentication handshake) and the
//! subscription bookkeeping (ref-counted topics, pending queue while offline,
//! debounced subscribe coalescing, per-consumer cleanup). Consumers talk to it
//! exclusively through a cloneable [`Client`] handle; a single background
//! worker task serializes every command, timer and inbound frame, so no
//! consumer ever touches the transport directly.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use livewire::{Anonymous, Client, Config, Topic};
//!
//! # async fn demo() -> Result<(), livewire::Error> {
//! let config = Config::for_origin("https://app.example.com", "/ws")?;
//! let session = Arc::new(Anonymous);
//! let client = Client::spawn(config, session.clone(), session);
//!
//! client.connect();
//! client.subscribe(vec![Topic::from("token:price:abc")], None).await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(missing_debug_implementations, missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod ledger;
pub mod listener;
pub mod wire;

mod backoff;
mod error;
mod state;

pub use auth::{Anonymous, SessionRefresh, TokenError, TokenProvider, TokenPurpose};
pub use client::{Client, ListenerGuard};
pub use config::Config;
pub use error::Error;
pub use ledger::ConsumerId;
pub use listener::Listener;
pub use state::ConnectionState;
pub use wire::{Envelope, Topic};

/// engine result type
pub type Result<T> = std::result::Result<T, Error>;
