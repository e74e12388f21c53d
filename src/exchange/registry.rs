// src/exchange/registry.rs

use chrono::Local;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::pending::PendingCall;
use super::transport::{ChannelHandle, Request, Response, Status};

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct Registration {
    call: Arc<PendingCall>,
    channel: ChannelHandle,
}

/// In-flight calls keyed by call id.
///
/// The call and its channel live in one map value, so they are inserted and
/// removed together. `resolve` is the only place a call leaves the map with
/// an outcome attached: because `DashMap::remove` is atomic, exactly one of
/// the racing paths (response, deadline, channel close) sees the entry.
#[derive(Default)]
pub struct CorrelationRegistry {
    calls: DashMap<u64, Registration>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids are expected to be unique per connection; a collision overwrites.
    ///
    /// The replaced call is marked displaced while the shard lock is held, so
    /// its own deadline still resolves it without touching the new entry.
    pub fn register(&self, id: u64, call: Arc<PendingCall>, channel: ChannelHandle) {
        match self.calls.entry(id) {
            Entry::Occupied(mut entry) => {
                let replaced = entry.insert(Registration { call, channel });
                replaced.call.mark_displaced();
                warn!(call_id = id, "Call id registered twice, replacing the earlier call");
            }
            Entry::Vacant(entry) => {
                entry.insert(Registration { call, channel });
            }
        }
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Removes `call`'s entry, leaving any call that replaced it in place.
    pub(crate) fn release(&self, call: &PendingCall) -> bool {
        self.calls
            .remove_if(&call.id(), |_, registration| {
                ptr::eq(Arc::as_ptr(&registration.call), call)
            })
            .is_some()
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<PendingCall>> {
        self.calls.get(&id).map(|entry| entry.call.clone())
    }

    /// Hands `response` to the matching call, if it is still pending.
    ///
    /// Returns `false` when the call was already resolved or never existed;
    /// that is the expected loser of a timeout/response race, not an error.
    pub fn resolve(&self, channel: &ChannelHandle, response: Response) -> bool {
        match self.calls.remove(&response.id) {
            Some((_, registration)) => {
                debug!(
                    call_id = response.id,
                    status = response.status.code(),
                    channel = %registration.channel,
                    "Resolving pending call"
                );
                registration.call.deliver(response);
                true
            }
            None => {
                warn!(
                    "The timeout response finally returned at {}, response {}, channel: {}",
                    Local::now().format(TIMESTAMP_FORMAT),
                    response,
                    channel
                );
                false
            }
        }
    }

    /// Deadline path: resolves `call` only if the entry under its id is still
    /// this very call. A displaced call is resolved directly.
    pub(crate) fn expire(&self, call: &Arc<PendingCall>, response: Response) -> bool {
        let owned = self
            .calls
            .remove_if(&call.id(), |_, registration| Arc::ptr_eq(&registration.call, call))
            .is_some();
        if owned || call.is_displaced() {
            debug!(call_id = call.id(), channel = %call.channel(), "Pending call expired");
            call.deliver(response);
            true
        } else {
            false
        }
    }

    /// Send-confirmation hook for the transport.
    pub fn mark_sent_for(&self, request: &Request) -> bool {
        self.mark_sent_for_id(request.id)
    }

    pub fn mark_sent_for_id(&self, id: u64) -> bool {
        match self.lookup(id) {
            Some(call) => {
                call.mark_sent();
                true
            }
            None => false,
        }
    }

    pub fn has_pending_call(&self, channel: &ChannelHandle) -> bool {
        self.calls.iter().any(|entry| entry.channel == *channel)
    }

    /// Fails every call still bound to `channel` with `CHANNEL_INACTIVE`.
    ///
    /// Returns how many calls this resolved.
    pub fn close_channel(&self, channel: &ChannelHandle) -> usize {
        let bound: Vec<Arc<PendingCall>> = self
            .calls
            .iter()
            .filter(|entry| entry.channel == *channel)
            .map(|entry| entry.call.clone())
            .collect();

        let mut resolved = 0;
        for call in bound {
            let response = Response::error(
                call.id(),
                Status::ChannelInactive,
                format!(
                    "Channel {} is inactive. Directly return the unfinished request: {}",
                    channel,
                    call.request()
                ),
            );
            if self.resolve(channel, response) {
                resolved += 1;
            }
        }

        if resolved > 0 {
            info!(channel = %channel, resolved, "Failed in-flight calls of closed channel");
        }
        resolved
    }

    /// Snapshot of every in-flight call.
    pub fn pending_calls(&self) -> Vec<Arc<PendingCall>> {
        self.calls.iter().map(|entry| entry.call.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeConfig;
    use crate::exchange::errors::RpcError;
    use crate::exchange::outcome::Outcome;
    use crate::exchange::service::Exchange;
    use crate::exchange::transport::{Channel, ChannelUrl};
    use serde_json::json;
    use std::time::Duration;

    struct StubChannel {
        handle: ChannelHandle,
        url: ChannelUrl,
    }

    impl Channel for StubChannel {
        fn handle(&self) -> ChannelHandle {
            self.handle.clone()
        }

        fn url(&self) -> &ChannelUrl {
            &self.url
        }
    }

    fn stub_channel() -> StubChannel {
        StubChannel {
            handle: ChannelHandle::new("10.0.0.1:1000", "10.0.0.2:2000"),
            url: ChannelUrl::new("stub://10.0.0.2:2000"),
        }
    }

    fn exchange(name: &str) -> Exchange {
        Exchange::start(ExchangeConfig {
            default_timeout_ms: 5000,
            timer_thread_name: name.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let exchange = exchange("registry-test-unregister");
        let channel = stub_channel();
        let request = Request::with_id(9001, json!("x"));
        exchange.issue(&channel, &request, None).unwrap();

        let registry = exchange.registry();
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(9001));
        assert!(!registry.unregister(9001));
        assert!(registry.is_empty());
        assert!(!registry.has_pending_call(&channel.handle()));
    }

    #[test]
    fn test_lookup_does_not_remove() {
        let exchange = exchange("registry-test-lookup");
        let channel = stub_channel();
        let request = Request::with_id(9002, json!("x"));
        let call = exchange.issue(&channel, &request, None).unwrap();

        let registry = exchange.registry();
        let found = registry.lookup(9002).unwrap();
        assert!(Arc::ptr_eq(&found, &call));
        assert!(registry.lookup(9002).is_some());
        assert!(registry.lookup(1).is_none());
    }

    #[test]
    fn test_mark_sent_only_for_known_ids() {
        let exchange = exchange("registry-test-sent");
        let channel = stub_channel();
        let request = Request::with_id(9003, json!("x"));
        let call = exchange.issue(&channel, &request, None).unwrap();

        let registry = exchange.registry();
        assert!(!registry.mark_sent_for_id(12345));
        assert!(!call.is_sent());
        assert!(registry.mark_sent_for(&request));
        assert!(call.is_sent());
    }

    #[test]
    fn test_resolve_unknown_id_is_a_no_op() {
        let registry = CorrelationRegistry::new();
        let channel = ChannelHandle::new("a", "b");
        assert!(!registry.resolve(&channel, Response::ok(77, Vec::new())));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_removes_before_delivering() {
        let exchange = exchange("registry-test-resolve");
        let channel = stub_channel();
        let request = Request::with_id(9004, json!("x"));
        let call = exchange.issue(&channel, &request, None).unwrap();

        let registry = exchange.registry();
        assert!(registry.has_pending_call(&channel.handle()));
        assert!(registry.resolve(&channel.handle(), Response::ok(9004, Vec::new())));
        assert!(call.is_resolved());
        assert!(registry.lookup(9004).is_none());
        assert!(!registry.has_pending_call(&channel.handle()));
        assert!(!registry.resolve(&channel.handle(), Response::ok(9004, Vec::new())));
    }

    #[test]
    fn test_duplicate_id_overwrites() {
        let exchange = exchange("registry-test-duplicate");
        let first_channel = stub_channel();
        let second_channel = stub_channel();
        let first = exchange
            .issue(&first_channel, &Request::with_id(9005, json!(1)), None)
            .unwrap();
        let second = exchange
            .issue(&second_channel, &Request::with_id(9005, json!(2)), None)
            .unwrap();

        let registry = exchange.registry();
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.lookup(9005).unwrap(), &second));
        assert!(!registry.has_pending_call(&first_channel.handle()));
        assert!(!first.is_resolved());
        assert!(first.is_displaced());
        assert!(!second.is_displaced());
    }

    #[test]
    fn test_displaced_call_deadline_leaves_replacement_alone() {
        let exchange = exchange("registry-test-displaced");
        let channel = stub_channel();
        let first = exchange
            .issue(&channel, &Request::with_id(9006, json!(1)), Some(Duration::from_millis(40)))
            .unwrap();
        let second = exchange
            .issue(&channel, &Request::with_id(9006, json!(2)), None)
            .unwrap();

        let outcome = first.blocking_get_timeout(Duration::from_secs(2));
        assert!(matches!(outcome, Err(RpcError::ClientTimeout { .. })));

        let registry = exchange.registry();
        assert!(!second.is_resolved());
        assert!(Arc::ptr_eq(&registry.lookup(9006).unwrap(), &second));

        assert!(registry.resolve(&channel.handle(), Response::ok(9006, Vec::new())));
        assert_eq!(second.blocking_get().unwrap(), None);
    }

    #[test]
    fn test_cancelling_displaced_call_keeps_replacement() {
        let exchange = exchange("registry-test-release");
        let channel = stub_channel();
        let first = exchange
            .issue(&channel, &Request::with_id(9008, json!(1)), None)
            .unwrap();
        let second = exchange
            .issue(&channel, &Request::with_id(9008, json!(2)), None)
            .unwrap();

        assert!(first.cancel());
        let registry = exchange.registry();
        assert!(Arc::ptr_eq(&registry.lookup(9008).unwrap(), &second));
        assert!(!registry.release(&first));
        assert!(registry.release(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expire_ignores_an_entry_it_does_not_own() {
        let exchange = exchange("registry-test-expire");
        let channel = stub_channel();
        let call = exchange
            .issue(&channel, &Request::with_id(9007, json!("x")), None)
            .unwrap();

        let registry = exchange.registry();
        assert!(registry.resolve(&channel.handle(), Response::ok(9007, Vec::new())));
        assert!(!registry.expire(&call, call.timeout_response()));
        assert_eq!(call.outcome(), Some(Outcome::Success(None)));
    }
}
