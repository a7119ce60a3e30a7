use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::protocol::{Context, Handler, ResponseCode};

#[derive(Debug, Default, Deserialize)]
struct RegisterAck {
    #[serde(default)]
    time: i64,
}

/// Marks the session registered once the server accepts `Register`.
pub struct RegisterHandler;

#[async_trait]
impl Handler for RegisterHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let msg = &ctx.message;
        if msg.code != Some(ResponseCode::Success) {
            return Err(AgentError::Handshake(format!(
                "registration rejected: {}",
                msg.msg
            )));
        }

        let ack: RegisterAck = if msg.data.is_null() {
            RegisterAck::default()
        } else {
            ctx.bind()?
        };
        ctx.session.state().set_registered(true);
        tracing::info!(server_time = ack.time, "Registered with server");
        Ok(())
    }
}

/// Consumes heartbeat echoes.
pub struct HeartbeatHandler;

#[async_trait]
impl Handler for HeartbeatHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        tracing::debug!(id = %ctx.message.id, code = ?ctx.message.code, "Heartbeat acknowledged");
        Ok(())
    }
}
