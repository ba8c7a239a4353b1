//! Helper daemon machinery.
//!
//! Application workers connect over a local socket; each connection is
//! served on a pooled thread and bound to a [`Service`] shared by every
//! client declaring the same settings.

pub mod client;
pub mod connection;
pub mod protocol;
pub mod sampler;
pub mod server;
pub mod service;
pub mod service_cache;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use client::{Client, is_helper_running, ping};
pub use protocol::{Command, ProtocolError, Response};
pub use server::{DaemonConfig, run};
pub use service::{Service, ServiceSettings};
pub use service_cache::ServiceCache;
pub use shutdown::ShutdownToken;
pub use transport::{Acceptor, SetupError, SocketAddress};
pub use worker::WorkerPool;
