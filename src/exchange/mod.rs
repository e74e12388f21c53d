// src/exchange/mod.rs
// Request/response correlation: pending calls, their registry, and deadlines.

pub mod errors;
pub mod outcome;
pub mod pending;
pub mod registry;
pub mod service;
pub mod timer;
pub mod transport;

mod completion;

// Re-export specific items to simplify imports elsewhere
pub use errors::{Result, RpcError};
pub use outcome::{Outcome, RpcResult};
pub use pending::{callback_fn, PendingCall, ResponseCallback};
pub use registry::CorrelationRegistry;
pub use service::Exchange;
pub use timer::{DeadlineHandle, TimeoutScheduler};
pub use transport::{Channel, ChannelHandle, ChannelUrl, Request, Response, Status};
