//! tnsnet: connection establishment for the TNS database wire protocol
//!
//! This library resolves connect strings, navigates connect descriptors into
//! an ordered set of candidate endpoints, and drives the packet-level
//! handshake (Connect, Accept, Refuse, Resend, Redirect) over TCP or TLS
//! until a server session is established. It covers the network session
//! layer only; what flows over the session afterwards is the caller's
//! protocol.
//!
//! The library is organized into the following main modules:
//! - `descriptor`: `(NAME=VALUE)` connect descriptor parsing and rendering
//! - `ezconnect`: easy-connect URL translation into descriptor text
//! - `navigator`: descriptor tree navigation into connect options
//! - `strategy`: retry/failover iteration over candidates
//! - `packet`: TNS packet builders and parsers
//! - `transport`: TCP/TLS transport with packet framing
//! - `session`: the network session state machine
//!
//! ```no_run
//! use tnsnet::{ConnectConfig, DriverContext};
//!
//! # async fn connect() -> Result<(), tnsnet::Error> {
//! let context = DriverContext::new();
//! let mut session = context.new_session();
//! let config = ConnectConfig {
//!     connect_string: "tcps://db.example.com:1522/orclpdb1".into(),
//!     ..ConnectConfig::default()
//! };
//! session.connect(&config, None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

use std::sync::Arc;

pub mod config;
pub mod descriptor;
pub mod down_hosts;
pub mod error;
pub mod ezconnect;
pub mod navigator;
pub mod negotiation;
pub mod packet;
pub mod session;
pub mod strategy;
pub mod transport;

pub use config::{ConnectConfig, SessionAttributes, TransportSettings};
pub use down_hosts::DownHostsCache;
pub use error::{Error, RefuseReason, Result, TimeoutKind};
pub use navigator::{ConnectOption, ConnectionDescription};
pub use session::{AliasSource, NetworkSession, SessionState};
pub use strategy::ConnectionStrategy;
pub use transport::DisconnectMode;

/// Shared state for all sessions created by one driver instance.
///
/// Today this is the down-hosts cache; sessions created from the same
/// context skip hosts another session recently failed to reach.
#[derive(Debug, Clone, Default)]
pub struct DriverContext {
    down_hosts: Arc<DownHostsCache>,
}

impl DriverContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn down_hosts(&self) -> &Arc<DownHostsCache> {
        &self.down_hosts
    }

    pub fn new_session(&self) -> NetworkSession {
        NetworkSession::new(Arc::clone(&self.down_hosts))
    }
}
