use anyhow::Result;
use rust_exchange::config::{self, DemoSettings};
use rust_exchange::env::apply_env_overrides;
use rust_exchange::exchange::{
    callback_fn, Channel, ChannelHandle, ChannelUrl, Exchange, Request, Response, RpcResult,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// In-process channel whose "server" echoes requests back after a delay.
struct LoopbackChannel {
    handle: ChannelHandle,
    url: ChannelUrl,
    outbound: mpsc::UnboundedSender<Request>,
}

impl Channel for LoopbackChannel {
    fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    fn url(&self) -> &ChannelUrl {
        &self.url
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rust_exchange=info".parse()?))
        .init();

    let mut app_config = config::load_config_or_default()?;
    apply_env_overrides(&mut app_config.exchange)?;
    let demo = app_config.demo.clone();

    let exchange = Arc::new(Exchange::start(app_config.exchange)?);

    let (outbound, inbound) = mpsc::unbounded_channel();
    let channel = LoopbackChannel {
        handle: ChannelHandle::new("127.0.0.1:50123", "127.0.0.1:20880"),
        url: ChannelUrl::parse("loopback://127.0.0.1:20880?timeout=300"),
        outbound,
    };

    let server = tokio::spawn(serve(
        exchange.clone(),
        channel.handle(),
        inbound,
        demo.clone(),
    ));

    let mut calls = Vec::new();
    for i in 0..demo.calls {
        let request = Request::new(json!({ "method": "echo", "args": [i] }));
        let call = exchange.issue(&channel, &request, None)?;

        if channel.outbound.send(request.clone()).is_err() {
            error!(call_id = request.id, "Loopback server is gone");
            call.cancel();
            continue;
        }
        exchange.mark_sent(&request);
        calls.push(call);
    }

    if let Some(first) = calls.first() {
        let call_id = first.id();
        first.register_callback(callback_fn(move |result| match result {
            Ok(value) => info!(call_id, ?value, "Callback received value"),
            Err(e) => warn!(call_id, error = %e, "Callback received failure"),
        }))?;
    }

    let results = futures::future::join_all(calls.iter().map(|call| call.wait())).await;
    for (call, result) in calls.iter().zip(results) {
        match result {
            Ok(value) => info!(call_id = call.id(), ?value, "Call succeeded"),
            Err(e) => warn!(
                call_id = call.id(),
                timeout = e.is_timeout(),
                error = %e,
                "Call failed"
            ),
        }
    }

    info!(
        in_flight = exchange.has_pending_call(&channel.handle()),
        "Demo finished"
    );

    drop(channel);
    let _ = server.await;
    exchange.shutdown();
    Ok(())
}

async fn serve(
    exchange: Arc<Exchange>,
    handle: ChannelHandle,
    mut inbound: mpsc::UnboundedReceiver<Request>,
    demo: DemoSettings,
) {
    let mut served: u64 = 0;
    while let Some(request) = inbound.recv().await {
        served += 1;
        if demo.unanswered_every > 0 && served % demo.unanswered_every == 0 {
            info!(call_id = request.id, "Server drops request");
            continue;
        }

        let exchange = exchange.clone();
        let handle = handle.clone();
        let latency = Duration::from_millis(demo.server_latency_ms);
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let response = match RpcResult::value(request.data.clone()).encode() {
                Ok(payload) => Response::ok(request.id, payload),
                Err(e) => {
                    error!(call_id = request.id, error = %e, "Failed to encode response");
                    return;
                }
            };
            exchange.resolve(&handle, response);
        });
    }
}
