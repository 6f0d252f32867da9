//! Heartbeat: periodic autonomous polls.
//!
//! The runner publishes a heartbeat prompt on the bus at a fixed interval;
//! the scheduler runs it against the default agent's main session. A reply
//! of `HEARTBEAT_OK` means nothing needs attention and is dropped; anything
//! else is delivered to the last active conversation.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{InboundMessage, MessageBus};

/// Exact token an agent replies with when a heartbeat needs no action.
pub const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

pub const HEARTBEAT_PROMPT: &str = "Periodic heartbeat poll. Review your memory, \
pending actions, and scheduled tasks. If something needs attention, handle it \
or report it. If nothing needs attention, reply with ONLY: HEARTBEAT_OK";

/// An acknowledgment is the bare token, possibly with minor padding
/// (punctuation, an emoji), never a real reply that mentions it.
pub fn is_heartbeat_ok(response: &str) -> bool {
    let trimmed = response.trim();
    trimmed == HEARTBEAT_OK_TOKEN
        || (trimmed.contains(HEARTBEAT_OK_TOKEN)
            && trimmed.len() <= HEARTBEAT_OK_TOKEN.len() + 30)
}

pub struct HeartbeatRunner {
    bus: Arc<dyn MessageBus>,
    /// Session the heartbeat turn runs in (the default agent's main key).
    session_key: String,
    interval: Duration,
    cancel: CancellationToken,
}

impl HeartbeatRunner {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        session_key: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            session_key: session_key.to_string(),
            interval,
            cancel,
        }
    }

    /// Tick until cancelled.
    pub async fn run(&self) {
        info!("Heartbeat runner started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Heartbeat runner stopping");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        debug!("Publishing heartbeat poll");
        let mut msg = InboundMessage::new("heartbeat", "heartbeat", "heartbeat", HEARTBEAT_PROMPT);
        msg.session_key = Some(self.session_key.clone());
        if let Err(e) = self.bus.publish_inbound(msg).await {
            warn!("Failed to publish heartbeat: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    #[test]
    fn test_is_heartbeat_ok() {
        assert!(is_heartbeat_ok("HEARTBEAT_OK"));
        assert!(is_heartbeat_ok("  HEARTBEAT_OK  "));
        assert!(is_heartbeat_ok("HEARTBEAT_OK 🦐"));
        assert!(!is_heartbeat_ok("The deploy failed, you should look at it"));
        assert!(!is_heartbeat_ok(
            "HEARTBEAT_OK but actually here is a long report that is not an ack"
        ));
    }

    #[tokio::test]
    async fn test_tick_publishes_heartbeat_with_session_key() {
        let bus = Arc::new(InMemoryBus::default());
        let runner = HeartbeatRunner::new(
            bus.clone(),
            "agent:main:main",
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        runner.tick().await;

        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.channel, "heartbeat");
        assert_eq!(msg.session_key.as_deref(), Some("agent:main:main"));
        assert_eq!(msg.content, HEARTBEAT_PROMPT);
    }
}
