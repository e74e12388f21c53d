// src/exchange/pending.rs

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::completion::Completion;
use super::errors::{Result, RpcError};
use super::outcome::Outcome;
use super::registry::{CorrelationRegistry, TIMESTAMP_FORMAT};
use super::timer::{DeadlineHandle, TimeoutScheduler};
use super::transport::{Channel, ChannelHandle, Request, Response, Status, TIMEOUT_KEY};

const CANCELLED_MESSAGE: &str = "request future has been canceled.";

/// Receiver for the outcome of a call, invoked exactly once.
pub trait ResponseCallback: Send + 'static {
    fn on_success(self: Box<Self>, value: Option<Value>);

    fn on_failure(self: Box<Self>, error: RpcError);
}

struct FnCallback<F>(F);

impl<F> ResponseCallback for FnCallback<F>
where
    F: FnOnce(Result<Option<Value>>) + Send + 'static,
{
    fn on_success(self: Box<Self>, value: Option<Value>) {
        (self.0)(Ok(value))
    }

    fn on_failure(self: Box<Self>, error: RpcError) {
        (self.0)(Err(error))
    }
}

/// Adapts a closure taking the call's result into a `ResponseCallback`.
pub fn callback_fn<F>(f: F) -> Box<dyn ResponseCallback>
where
    F: FnOnce(Result<Option<Value>>) + Send + 'static,
{
    Box::new(FnCallback(f))
}

/// One in-flight request waiting for its response.
pub struct PendingCall {
    id: u64,
    channel: ChannelHandle,
    request: String,
    timeout: Duration,
    default_wait: Duration,
    started: Instant,
    started_at: DateTime<Local>,
    sent: OnceLock<Instant>,
    displaced: AtomicBool,
    completion: Completion<Outcome>,
    deadline: Mutex<Option<DeadlineHandle>>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingCall {
    /// Registers a call for `request` and arms its deadline.
    ///
    /// The timeout is `timeout` when non-zero, else the channel's `timeout`
    /// URL parameter, else `default_timeout`.
    pub(crate) fn issue(
        registry: &Arc<CorrelationRegistry>,
        scheduler: &TimeoutScheduler,
        default_timeout: Duration,
        channel: &dyn Channel,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let timeout = match timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => Duration::from_millis(
                channel
                    .url()
                    .positive_parameter(TIMEOUT_KEY, default_timeout.as_millis() as u64),
            ),
        };
        let handle = channel.handle();

        let call = Arc::new(Self {
            id: request.id,
            channel: handle.clone(),
            request: request.to_string(),
            timeout,
            default_wait: default_timeout,
            started: Instant::now(),
            started_at: Local::now(),
            sent: OnceLock::new(),
            displaced: AtomicBool::new(false),
            completion: Completion::new(),
            deadline: Mutex::new(None),
            registry: registry.clone(),
        });

        registry.register(call.id, call.clone(), handle.clone());

        let weak = Arc::downgrade(&call);
        let deadline_registry = registry.clone();
        let armed = scheduler.schedule(timeout, move || {
            if let Some(call) = weak.upgrade() {
                if !call.is_resolved() {
                    let response = call.timeout_response();
                    deadline_registry.expire(&call, response);
                }
            }
        });

        match armed {
            Ok(deadline) => {
                *call.deadline.lock() = Some(deadline);
                // A response may have landed before the handle was stored.
                if call.is_resolved() {
                    call.retire_deadline();
                }
            }
            Err(e) => {
                registry.release(&call);
                return Err(RpcError::TransportError {
                    channel: handle.to_string(),
                    message: format!("Failed to arm deadline for call {}: {}", call.id, e),
                });
            }
        }

        debug!(
            call_id = call.id,
            channel = %handle,
            timeout_ms = timeout.as_millis() as u64,
            "Pending call issued"
        );
        Ok(call)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn is_sent(&self) -> bool {
        self.sent.get().is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.is_complete()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.completion.get()
    }

    /// Whether a later call with the same id replaced this one in the registry.
    pub fn is_displaced(&self) -> bool {
        self.displaced.load(Ordering::Acquire)
    }

    pub(crate) fn mark_displaced(&self) {
        self.displaced.store(true, Ordering::Release);
    }

    /// Records that the request bytes reached the transport. Only the first call counts.
    pub fn mark_sent(&self) {
        let _ = self.sent.set(Instant::now());
    }

    /// Blocks until the call resolves.
    pub fn blocking_get(&self) -> Result<Option<Value>> {
        self.completion.wait().to_result(&self.channel)
    }

    /// Blocks for at most `window` (zero means the configured default).
    ///
    /// Running out of time here does not resolve the call; it stays pending
    /// and may still complete later.
    pub fn blocking_get_timeout(&self, window: Duration) -> Result<Option<Value>> {
        let window = if window.is_zero() { self.default_wait } else { window };
        match self.completion.wait_for(window) {
            Some(outcome) => outcome.to_result(&self.channel),
            None => Err(self.timeout_error(false)),
        }
    }

    /// Blocks until resolved and deserializes the value into `T`.
    pub fn blocking_get_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.blocking_get()?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    pub async fn wait(&self) -> Result<Option<Value>> {
        self.completion.wait_async().await.to_result(&self.channel)
    }

    pub async fn wait_timeout(&self, window: Duration) -> Result<Option<Value>> {
        let window = if window.is_zero() { self.default_wait } else { window };
        match tokio::time::timeout(window, self.completion.wait_async()).await {
            Ok(outcome) => outcome.to_result(&self.channel),
            Err(_) => Err(self.timeout_error(false)),
        }
    }

    /// Arranges for `callback` to receive the result exactly once.
    ///
    /// Runs it right away on this thread if the call is already resolved.
    /// Only one callback may be registered per call.
    pub fn register_callback(&self, callback: Box<dyn ResponseCallback>) -> Result<()> {
        let call_id = self.id;
        let channel = self.channel.clone();
        let accepted = self.completion.on_complete(move |outcome: Outcome| {
            let result = outcome.to_result(&channel);
            // The callback runs on the transport or timer thread; a panic stays here.
            let invoked = panic::catch_unwind(AssertUnwindSafe(move || match result {
                Ok(value) => callback.on_success(value),
                Err(error) => callback.on_failure(error),
            }));
            if let Err(payload) = invoked {
                error!(
                    call_id,
                    channel = %channel,
                    panic = panic_message(payload.as_ref()),
                    "Response callback panicked"
                );
            }
        });

        if accepted {
            Ok(())
        } else {
            Err(RpcError::InvalidUse(format!(
                "a callback is already registered for call {}",
                self.id
            )))
        }
    }

    /// Resolves the call as cancelled and drops it from the registry.
    ///
    /// Returns `true` when this cancellation is what resolved the call, `false`
    /// when a response or timeout got there first. Either way the call is
    /// resolved once this returns.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CANCELLED_MESSAGE)
    }

    pub(crate) fn cancel_with(&self, reason: &str) -> bool {
        self.registry.release(self);
        let cancelled = self.completion.complete(Outcome::Cancelled(reason.to_string()));
        self.retire_deadline();

        if cancelled {
            info!(call_id = self.id, channel = %self.channel, reason, "Pending call cancelled");
        }
        cancelled
    }

    /// Called by the registry once it has removed this call.
    pub(crate) fn deliver(&self, response: Response) {
        self.retire_deadline();
        let outcome = Outcome::from_response(response);
        if !outcome.is_success() {
            debug!(call_id = self.id, outcome = ?outcome, "Pending call failed");
        }
        if !self.completion.complete(outcome) {
            warn!(call_id = self.id, "Dropping response for a call that already resolved");
        }
    }

    fn retire_deadline(&self) {
        if let Some(deadline) = self.deadline.lock().take() {
            deadline.cancel();
        }
    }

    pub(crate) fn timeout_response(&self) -> Response {
        let status = if self.is_sent() {
            Status::ServerTimeout
        } else {
            Status::ClientTimeout
        };
        Response::error(self.id, status, self.timeout_message(true))
    }

    fn timeout_error(&self, scan: bool) -> RpcError {
        let channel = self.channel.to_string();
        let message = self.timeout_message(scan);
        if self.is_sent() {
            RpcError::ServerTimeout { channel, message }
        } else {
            RpcError::ClientTimeout { channel, message }
        }
    }

    pub(crate) fn timeout_message(&self, scan: bool) -> String {
        let now = Instant::now();
        let sent = self.sent.get().copied();

        let headline = match sent {
            Some(_) => "Waiting server-side response timeout",
            None => "Sending request timeout in client-side",
        };
        let elapsed = match sent {
            Some(sent) => format!(
                "client elapsed: {} ms, server elapsed: {}",
                sent.duration_since(self.started).as_millis(),
                now.duration_since(sent).as_millis()
            ),
            None => format!("elapsed: {}", now.duration_since(self.started).as_millis()),
        };

        format!(
            "{}{}. start time: {}, end time: {}, {} ms, timeout: {} ms, request: {}, channel: {}",
            headline,
            if scan { " by scan timer" } else { "" },
            self.started_at.format(TIMESTAMP_FORMAT),
            Local::now().format(TIMESTAMP_FORMAT),
            elapsed,
            self.timeout.as_millis(),
            self.request,
            self.channel
        )
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("channel", &self.channel.to_string())
            .field("timeout", &self.timeout)
            .field("sent", &self.is_sent())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
