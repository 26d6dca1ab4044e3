//! # Traceline Demo
//!
//! End-to-end demonstration against a local collector daemon: starts a
//! trace, fans out concurrent subsegments, annotates them, and prints the
//! emitter counters at the end.
//!
//! ## Running
//!
//! ```bash
//! # Against the default daemon at 127.0.0.1:2000
//! cargo run -p traceline --bin demo
//!
//! # Against another collector
//! cargo run -p traceline --bin demo -- 127.0.0.1:3000
//! ```
//!
//! No collector listening is fine too: the transport is fire-and-forget,
//! so the demo completes either way and the counters tell the story.

use std::net::SocketAddr;
use std::time::Duration;
use traceline::{Config, Recorder, Sampler, SamplingRequest, SamplingRule, UdpTransport};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> std::io::Result<()> {
    let daemon_address: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| traceline::DEFAULT_DAEMON_ADDRESS.to_string())
        .parse()
        .expect("daemon address must be host:port");

    println!("=== Traceline demo ===");
    println!("collector: {daemon_address}\n");

    let config = Config::default()
        .with_daemon_address(daemon_address)
        .with_service_name("demo-service")
        .with_close_deadline(Duration::from_secs(2));

    // Sample everything so the demo always produces output.
    let sampler = Sampler::new(vec![SamplingRule::new("demo", 1).with_fixed_rate(1.0)]);
    let transport = UdpTransport::connect(config.daemon_address).await?;
    let recorder = Recorder::with_parts(config, sampler, std::sync::Arc::new(transport));

    // Root segment for an inbound request.
    let request = SamplingRequest {
        host: "demo.example.com".to_string(),
        method: "GET".to_string(),
        url_path: "/orders/42".to_string(),
        service_name: "demo-service".to_string(),
    };
    let (ctx, segment) = recorder
        .context()
        .begin_with_request("demo-request", &request)
        .expect("fresh context is open");
    segment.put_annotation("customer_tier", "gold").ok();
    println!("trace:   {}", segment.trace_id());
    println!("segment: {}", segment.id());

    // Concurrent downstream calls branching from the same context.
    let mut tasks = Vec::new();
    for name in ["inventory", "pricing", "shipping"] {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            let (_branch, subsegment) = ctx.begin_remote(name).expect("parent is open");
            println!("  -> {name}: {}", subsegment.downstream_header().encode());
            tokio::time::sleep(Duration::from_millis(20)).await;
            subsegment.close().expect("first close");
        }));
    }
    for task in tasks {
        task.await.expect("branch task");
    }

    // A health-check path that must never be collected.
    let (_health_ctx, health) = ctx.begin_unsampled("health-check").expect("parent is open");
    health.close().expect("first close");

    segment.close().expect("first close");
    recorder.shutdown().await;

    let metrics = recorder.emitter_metrics();
    println!("\n=== Emitter counters ===");
    println!("sent:              {}", metrics.sent());
    println!("dropped (queue):   {}", metrics.dropped_full());
    println!("dropped (size):    {}", metrics.dropped_oversized());
    println!("transport errors:  {}", metrics.transport_errors());
    Ok(())
}
