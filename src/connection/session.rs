use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::connection::heartbeat::HeartbeatSender;
use crate::connection::identity::AgentIdentity;
use crate::connection::roster::{Roster, Server};
use crate::error::{AgentError, Result};
use crate::protocol::{types, Message};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Frame>;
type WsSource = SplitStream<WsStream>;

/// Connection flags shared by the session loops and the handlers.
#[derive(Debug)]
pub struct SessionState {
    connected: watch::Sender<bool>,
    registered: AtomicBool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            connected,
            registered: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    /// Drop the registration, then the connection flag.
    pub fn mark_lost(&self) {
        self.set_registered(false);
        self.set_connected(false);
    }

    /// Wait until the session is connected but not registered. Returns false
    /// once the state is gone.
    ///
    /// A reconnect can flip the flag down and back up before the caller is
    /// polled, so every change is rechecked rather than waiting for `false`.
    pub async fn wait_until_unregistered(&self, connected: &mut watch::Receiver<bool>) -> bool {
        loop {
            if connected.wait_for(|up| *up).await.is_err() {
                return false;
            }
            if !self.is_registered() {
                return true;
            }
            if connected.changed().await.is_err() {
                return false;
            }
        }
    }
}

/// Cloneable sending side of a session.
///
/// Messages queued while the socket is down stay in the bounded outbound
/// queue until the write loop has a connection again; `send` waits when the
/// queue is full.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    agent_id: Arc<str>,
    state: Arc<SessionState>,
    outbound: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub fn new(
        agent_id: impl Into<Arc<str>>,
        state: Arc<SessionState>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            state,
            outbound,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        let msg = self.stamp(msg);
        self.outbound
            .send(msg)
            .await
            .map_err(|_| AgentError::Disconnected)
    }

    /// Queue without waiting; fails if the outbound queue is full.
    pub fn try_send(&self, msg: Message) -> Result<()> {
        let msg = self.stamp(msg);
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AgentError::Internal("outbound queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => AgentError::Disconnected,
        })
    }

    fn stamp(&self, mut msg: Message) -> Message {
        msg.from = self.agent_id.to_string();
        if msg.id.is_empty() {
            msg.id = Uuid::new_v4().to_string();
        }
        msg
    }
}

/// Open a socket to `server` and read its load announcement.
///
/// The first data frame must be a plain integer; anything else fails the probe.
pub async fn probe(server: &Server, agent_id: &str, timeout: Duration) -> Result<WsStream> {
    let url = server.dial_url(agent_id);
    let handshake = async {
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let load = read_load(&mut ws).await?;
        Ok::<_, AgentError>((ws, load))
    };

    let outcome = match tokio::time::timeout(timeout, handshake).await {
        Ok(outcome) => outcome,
        Err(_) => Err(AgentError::Timeout(timeout)),
    };

    match outcome {
        Ok((ws, load)) => {
            server.record_load(load).await;
            tracing::info!(server = %server.url(), load, "Connected to server");
            Ok(ws)
        }
        Err(e) => {
            server.mark_unreachable().await;
            Err(e)
        }
    }
}

async fn read_load(ws: &mut WsStream) -> Result<i64> {
    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => String::from_utf8(bytes)
                .map_err(|_| AgentError::Handshake("load frame is not UTF-8".to_string()))?,
            Frame::Ping(_) | Frame::Pong(_) => continue,
            other => {
                return Err(AgentError::Handshake(format!(
                    "unexpected frame before load: {:?}",
                    other
                )))
            }
        };
        return text
            .trim()
            .parse()
            .map_err(|_| AgentError::Handshake(format!("non-numeric load value: {:?}", text)));
    }
    Err(AgentError::Handshake(
        "connection closed before load frame".to_string(),
    ))
}

/// Probe every server in the roster and keep the least-loaded reachable one.
///
/// Ties go to the server listed first. Sockets to the other servers are closed.
pub async fn select_best(
    roster: &Roster,
    agent_id: &str,
    timeout: Duration,
) -> Result<(Arc<Server>, WsStream)> {
    let probes = roster
        .servers()
        .iter()
        .map(|server| async move { (server.clone(), probe(server, agent_id, timeout).await) });
    let results = futures::future::join_all(probes).await;

    let mut best: Option<(Arc<Server>, i64, WsStream)> = None;
    for (server, result) in results {
        match result {
            Ok(ws) => {
                let load = server.load().await.load;
                if best.as_ref().map_or(true, |(_, min, _)| load < *min) {
                    best = Some((server, load, ws));
                }
            }
            Err(e) => {
                tracing::warn!(server = %server.url(), error = %e, "Server probe failed");
            }
        }
    }

    let (server, load, ws) = best.ok_or(AgentError::NoReachableServer)?;
    tracing::info!(server = %server.url(), load, "Selected least-loaded server");
    Ok((server, ws))
}

/// One logical connection to the chosen control-plane server.
pub struct Session {
    identity: Arc<AgentIdentity>,
    server: Arc<Server>,
    config: ConnectionConfig,
    state: Arc<SessionState>,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    inbound: mpsc::Sender<Message>,
    sink: Arc<Mutex<Option<WsSink>>>,
    pending: Mutex<Option<WsStream>>,
}

impl Session {
    /// `initial` is a socket already opened by [`select_best`]; it is used for
    /// the first connection instead of dialing again.
    pub fn new(
        identity: Arc<AgentIdentity>,
        server: Arc<Server>,
        config: ConnectionConfig,
        inbound: mpsc::Sender<Message>,
        initial: Option<WsStream>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        Self {
            identity,
            server,
            config,
            state: Arc::new(SessionState::new()),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            inbound,
            sink: Arc::new(Mutex::new(None)),
            pending: Mutex::new(initial),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(
            self.identity.id.as_str(),
            self.state.clone(),
            self.outbound_tx.clone(),
        )
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Keep the session up until `shutdown` fires.
    ///
    /// Each cycle connects (retrying on a fixed delay), starts the read, write,
    /// registration and heartbeat tasks, and waits for the write loop to end.
    /// A write failure tears the cycle down and the next cycle reconnects.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let ws = tokio::select! {
                _ = shutdown.cancelled() => break,
                ws = self.connect_with_retry() => ws,
            };

            let (sink, source) = ws.split();
            *self.sink.lock().await = Some(sink);
            self.state.set_registered(false);
            self.state.set_connected(true);

            let reader = tokio::spawn(self.clone().read_loop(source));
            let mut writer = tokio::spawn(self.clone().write_loop());
            let registrar = tokio::spawn(self.clone().registration_loop());
            let heartbeat = {
                let sender = HeartbeatSender::new(self.config.heartbeat_interval);
                let handle = self.handle();
                let identity = self.identity.clone();
                tokio::spawn(async move { sender.run(handle, identity).await })
            };

            let stopping = tokio::select! {
                _ = shutdown.cancelled() => true,
                result = &mut writer => {
                    match result {
                        Ok(Ok(())) => tracing::info!("Write loop finished"),
                        Ok(Err(e)) => tracing::warn!(error = %e, "Write loop failed, re-establishing session"),
                        Err(e) => tracing::error!(error = %e, "Write loop task aborted"),
                    }
                    false
                }
            };

            reader.abort();
            registrar.abort();
            heartbeat.abort();
            writer.abort();
            self.state.mark_lost();

            if stopping {
                self.close().await;
                break;
            }
            *self.sink.lock().await = None;
        }
        tracing::info!(server = %self.server.url(), "Session stopped");
        Ok(())
    }

    async fn connect_with_retry(&self) -> WsStream {
        if let Some(ws) = self.pending.lock().await.take() {
            return ws;
        }
        loop {
            match probe(&self.server, &self.identity.id, self.config.probe_timeout).await {
                Ok(ws) => return ws,
                Err(e) => {
                    tracing::warn!(
                        server = %self.server.url(),
                        error = %e,
                        retry_in = ?self.config.connect_retry_delay,
                        "Connect failed"
                    );
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
            }
        }
    }

    /// Reconnect after a read failure. The first attempt is immediate.
    async fn reconnect_in_place(&self) -> WsSource {
        loop {
            match probe(&self.server, &self.identity.id, self.config.probe_timeout).await {
                Ok(ws) => {
                    let (sink, source) = ws.split();
                    *self.sink.lock().await = Some(sink);
                    self.state.set_connected(true);
                    return source;
                }
                Err(e) => {
                    tracing::warn!(server = %self.server.url(), error = %e, "Reconnect failed");
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        loop {
            let failure = match source.next().await {
                Some(Ok(Frame::Text(text))) => {
                    self.forward(&text).await;
                    continue;
                }
                Some(Ok(Frame::Binary(bytes))) => {
                    match String::from_utf8(bytes) {
                        Ok(text) => self.forward(&text).await,
                        Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                    }
                    continue;
                }
                Some(Ok(Frame::Close(frame))) => format!("server closed connection: {:?}", frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => e.to_string(),
                None => "connection closed".to_string(),
            };

            tracing::warn!(server = %self.server.url(), reason = %failure, "Read failed, reconnecting");
            self.state.mark_lost();
            source = self.reconnect_in_place().await;
        }
    }

    async fn forward(&self, text: &str) {
        tracing::debug!(frame = %text, "Received frame");
        match Message::decode(text) {
            Ok(msg) => {
                if self.inbound.send(msg).await.is_err() {
                    tracing::warn!("Dispatcher queue closed, dropping message");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Dropping malformed message"),
        }
    }

    async fn write_loop(self: Arc<Self>) -> Result<()> {
        let mut outbound = self.outbound_rx.lock().await;
        let mut connected = self.state.subscribe();

        while let Some(msg) = outbound.recv().await {
            if connected.wait_for(|up| *up).await.is_err() {
                return Err(AgentError::Disconnected);
            }

            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(msg_type = %msg.msg_type, error = %e, "Dropping unencodable message");
                    continue;
                }
            };

            let mut slot = self.sink.lock().await;
            let sink = slot.as_mut().ok_or(AgentError::Disconnected)?;
            if let Err(e) = sink.send(Frame::Text(text)).await {
                tracing::error!(msg_type = %msg.msg_type, id = %msg.id, error = %e, "Write failed");
                return Err(e.into());
            }
            tracing::debug!(msg_type = %msg.msg_type, id = %msg.id, "Sent message");
        }
        Ok(())
    }

    /// Announce this agent until the server acknowledges, and again after
    /// every reconnect.
    async fn registration_loop(self: Arc<Self>) {
        let handle = self.handle();
        let mut connected = self.state.subscribe();

        loop {
            if !self.state.wait_until_unregistered(&mut connected).await {
                return;
            }

            tracing::info!(agent_id = %self.identity.id, "Registering");
            let register = Message::request(types::REGISTER, self.identity.client_info_value());
            if let Err(e) = handle.send(register).await {
                tracing::warn!(error = %e, "Failed to queue registration");
            }

            tokio::time::sleep(self.config.register_retry_delay).await;
            if self.state.is_registered() {
                tracing::info!(agent_id = %self.identity.id, "Registration acknowledged");
            } else {
                tracing::warn!(
                    retry_in = ?self.config.register_retry_delay,
                    "Registration not acknowledged, retrying"
                );
            }
        }
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.send(Frame::Close(None)).await {
                tracing::debug!(error = %e, "Close frame not delivered");
            }
            let _ = sink.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_session_does_not_reregister() {
        let state = Arc::new(SessionState::new());
        state.set_connected(true);
        state.set_registered(true);

        let mut connected = state.subscribe();
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            state.wait_until_unregistered(&mut connected),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn reconnect_before_poll_still_triggers_registration() {
        let state = Arc::new(SessionState::new());
        state.set_connected(true);
        state.set_registered(true);

        let waiter = {
            let state = state.clone();
            let mut connected = state.subscribe();
            tokio::spawn(async move { state.wait_until_unregistered(&mut connected).await })
        };
        // Let the waiter park on the registered, connected session
        tokio::task::yield_now().await;

        // Drop and restore the connection without yielding in between
        state.mark_lost();
        state.set_connected(true);

        let needs_register = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("registration wait missed the reconnect")
            .unwrap();
        assert!(needs_register);
        assert!(state.is_connected());
        assert!(!state.is_registered());
    }

    #[tokio::test]
    async fn unregistered_session_proceeds_once_connected() {
        let state = Arc::new(SessionState::new());
        let mut connected = state.subscribe();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_until_unregistered(&mut connected).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        state.set_connected(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }
}
