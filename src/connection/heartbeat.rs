use std::sync::Arc;
use std::time::Duration;

use crate::connection::identity::AgentIdentity;
use crate::connection::session::SessionHandle;
use crate::error::AgentError;
use crate::protocol::{types, Message};

/// Periodically queues a keepalive on the session's outbound path.
///
/// Beats are best-effort: a full queue or a disconnected session skips the
/// beat rather than waiting.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run(&self, session: SessionHandle, identity: Arc<AgentIdentity>) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; registration already announced us.
        interval.tick().await;

        loop {
            interval.tick().await;
            if !session.state().is_connected() {
                tracing::debug!("Skipping heartbeat while disconnected");
                continue;
            }

            let beat = Message::request(types::HEARTBEAT, identity.client_info_value());
            match session.try_send(beat) {
                Ok(()) => tracing::debug!("Heartbeat queued"),
                Err(AgentError::Disconnected) => {
                    // Outbound queue closed, session is gone
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "Dropping heartbeat"),
            }
        }
    }
}
