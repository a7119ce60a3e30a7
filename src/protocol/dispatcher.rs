use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::SessionHandle;
use crate::error::{AgentError, Result};
use crate::protocol::message::{Message, ResponseCode};

/// Capability to process one message type.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &Context) -> Result<()>;

    /// Name used when listing registered handlers.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Per-message execution context handed to a [`Handler`].
pub struct Context {
    pub session: SessionHandle,
    pub message: Message,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new(session: SessionHandle, message: Message) -> Self {
        let deadline = message.deadline().map(|d| Instant::now() + d);
        Self {
            session,
            message,
            cancel: CancellationToken::new(),
            deadline,
        }
    }

    /// Cancelled by [`Context::abort`] or when the message deadline passes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Decode the message payload.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.message.data.clone())?)
    }

    pub async fn respond(&self, code: ResponseCode, msg: &str, data: Option<Value>) -> Result<()> {
        self.session.send(self.message.reply(code, msg, data)).await
    }

    pub async fn json_success<T: Serialize>(&self, payload: &T) -> Result<()> {
        let data = serde_json::to_value(payload)?;
        self.respond(ResponseCode::Success, "ok", Some(data)).await
    }

    pub async fn json_error(&self, code: ResponseCode, msg: &str) -> Result<()> {
        self.respond(code, msg, None).await
    }
}

/// Message type → handler table, fixed before the workers start.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if `msg_type` already has a handler. Callers treat this as fatal.
    pub fn register(&mut self, msg_type: &str, handler: Arc<dyn Handler>) -> Result<()> {
        if self.handlers.contains_key(msg_type) {
            return Err(AgentError::DuplicateHandler(msg_type.to_string()));
        }
        self.handlers.insert(msg_type.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, msg_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(msg_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn log_registered(&self) {
        for msg_type in self.types() {
            if let Some(handler) = self.handlers.get(msg_type) {
                tracing::info!(msg_type, handler = handler.name(), "Registered handler");
            }
        }
    }
}

/// Bounded inbound queue drained by a fixed pool of workers.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    queue: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl Dispatcher {
    /// Returns the dispatcher and the sender the read loop feeds.
    pub fn new(registry: HandlerRegistry, capacity: usize) -> (Self, mpsc::Sender<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let dispatcher = Self {
            registry: Arc::new(registry),
            queue: Arc::new(Mutex::new(rx)),
        };
        (dispatcher, tx)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn spawn_workers(
        &self,
        session: SessionHandle,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|worker_id| {
                let registry = self.registry.clone();
                let queue = self.queue.clone();
                let session = session.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    Self::worker_loop(worker_id, registry, queue, session, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(
        worker_id: usize,
        registry: Arc<HandlerRegistry>,
        queue: Arc<Mutex<mpsc::Receiver<Message>>>,
        session: SessionHandle,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    msg = rx.recv() => msg,
                }
            };
            let Some(msg) = next else {
                break;
            };
            dispatch(&registry, &session, msg).await;
        }
        tracing::debug!(worker_id, "Dispatch worker stopped");
    }
}

/// Route one message to its handler.
///
/// Handler errors and panics are logged and never escape; unmatched types are
/// dropped without a response.
pub async fn dispatch(registry: &HandlerRegistry, session: &SessionHandle, msg: Message) {
    let Some(handler) = registry.get(&msg.msg_type) else {
        tracing::warn!(msg_type = %msg.msg_type, id = %msg.id, "No handler registered for message type");
        return;
    };

    let msg_type = msg.msg_type.clone();
    let id = msg.id.clone();
    let ctx = Context::new(session.clone(), msg);

    match AssertUnwindSafe(run_handler(handler.as_ref(), &ctx))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => tracing::debug!(msg_type = %msg_type, id = %id, "Message handled"),
        Ok(Err(e)) => {
            tracing::warn!(msg_type = %msg_type, id = %id, error = %e, "Error handling message")
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(msg_type = %msg_type, id = %id, reason = %reason, "Handler panicked");
        }
    }
}

async fn run_handler(handler: &dyn Handler, ctx: &Context) -> Result<()> {
    let work = handler.handle(ctx);
    tokio::pin!(work);

    match ctx.deadline() {
        Some(deadline) => tokio::select! {
            result = &mut work => result,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(msg_type = %ctx.message.msg_type, id = %ctx.message.id, "Message deadline exceeded, cancelling handler");
                ctx.abort();
                work.await
            }
        },
        None => work.await,
    }
}
