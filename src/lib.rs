//! Request/response correlation for an RPC transport.
//!
//! A caller issues a [`PendingCall`](exchange::PendingCall) for each request it
//! writes. The transport hands every incoming response to
//! [`Exchange::resolve`](exchange::Exchange::resolve), and a shared timer
//! resolves calls that outlive their deadline. Each call resolves exactly once.

pub mod config;
pub mod env;
pub mod exchange;

pub use config::{AppConfig, ExchangeConfig};
pub use exchange::{Exchange, PendingCall, RpcError};
