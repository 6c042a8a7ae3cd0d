//! netrelay - a small multi-instance network service engine.
//!
//! Two raw service behaviors, byte echo and transparent relay, over both
//! TCP and UDP, behind one lifecycle contract ([`server::NetServer`]) so a
//! host process can run many instances under different listen/destination
//! addresses.

pub mod address;
pub mod admission;
pub mod async_stream;
pub mod config;
pub mod echo_server;
pub mod proxy_server;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod tls;
pub mod udp_session;

pub use config::{load_configs, ServerConfig, ServerMode};
pub use echo_server::EchoServer;
pub use proxy_server::ProxyServer;
pub use server::NetServer;
