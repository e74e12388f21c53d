// src/exchange/service.rs

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::errors::Result;
use super::pending::PendingCall;
use super::registry::CorrelationRegistry;
use super::timer::TimeoutScheduler;
use super::transport::{Channel, ChannelHandle, Request, Response};
use crate::config::ExchangeConfig;

/// Owns the registry and the timeout scheduler for one runtime.
///
/// Create one per process (or one per test) with `start`, and tear it down
/// with `shutdown`.
pub struct Exchange {
    config: ExchangeConfig,
    registry: Arc<CorrelationRegistry>,
    scheduler: TimeoutScheduler,
}

impl Exchange {
    pub fn start(config: ExchangeConfig) -> Result<Self> {
        let scheduler = TimeoutScheduler::start(&config.timer_thread_name)?;
        info!(
            default_timeout_ms = config.default_timeout_ms,
            "Exchange started"
        );

        Ok(Self {
            config,
            registry: Arc::new(CorrelationRegistry::new()),
            scheduler,
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Starts tracking `request`, which the caller is about to write to `channel`.
    pub fn issue(
        &self,
        channel: &dyn Channel,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Arc<PendingCall>> {
        PendingCall::issue(
            &self.registry,
            &self.scheduler,
            self.config.default_timeout(),
            channel,
            request,
            timeout,
        )
    }

    /// Receive-path entry point for the transport.
    pub fn resolve(&self, channel: &ChannelHandle, response: Response) -> bool {
        self.registry.resolve(channel, response)
    }

    /// Send-confirmation entry point for the transport.
    pub fn mark_sent(&self, request: &Request) -> bool {
        self.registry.mark_sent_for(request)
    }

    pub fn has_pending_call(&self, channel: &ChannelHandle) -> bool {
        self.registry.has_pending_call(channel)
    }

    pub fn close_channel(&self, channel: &ChannelHandle) -> usize {
        self.registry.close_channel(channel)
    }

    /// Stops the scheduler and cancels every call still in flight, since
    /// none of them could time out any more.
    ///
    /// The sweep runs after the timer thread has stopped accepting deadlines,
    /// so a call issued concurrently is either swept here or rejected by `issue`.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();

        let mut cancelled = 0;
        loop {
            let leftovers = self.registry.pending_calls();
            if leftovers.is_empty() {
                break;
            }
            for call in leftovers {
                if call.cancel_with("exchange is shutting down") {
                    cancelled += 1;
                }
            }
        }
        info!(cancelled, "Exchange shut down");
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.scheduler.is_shutdown() {
            self.shutdown();
        }
    }
}
