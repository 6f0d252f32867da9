//! `krill gateway` — run the scheduling core until Ctrl-C.
//!
//! Starts the scheduler, the heartbeat runner when enabled, and an outbound
//! drain that hands messages to transports. With no transport adapters
//! connected the drain logs deliveries, which is what you want when
//! supervising the runtime from a terminal.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::build_runtime;
use crate::heartbeat::HeartbeatRunner;

pub async fn run() -> Result<()> {
    let runtime = build_runtime(None)?;
    info!(
        "Gateway starting with agents: {}",
        runtime.registry.ids().join(", ")
    );

    if runtime.config.heartbeat.enabled {
        let runner = HeartbeatRunner::new(
            runtime.bus.clone(),
            &runtime.registry.default_agent().main_session_key(),
            Duration::from_secs(runtime.config.heartbeat.interval_minutes * 60),
            runtime.cancel.child_token(),
        );
        tokio::spawn(async move { runner.run().await });
    }

    let outbound_bus = Arc::clone(&runtime.bus);
    tokio::spawn(async move {
        use crate::bus::MessageBus;
        while let Some(out) = outbound_bus.consume_outbound().await {
            info!("outbound [{}:{}] {}", out.channel, out.chat_id, out.content);
        }
    });

    let scheduler = Arc::clone(&runtime.scheduler);
    let handle = tokio::spawn(async move { scheduler.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    runtime.cancel.cancel();
    let _ = handle.await;
    Ok(())
}
