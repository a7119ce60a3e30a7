use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::connection::{select_best, AgentIdentity, Roster, Session};
use crate::error::Result;
use crate::handlers;
use crate::protocol::{Dispatcher, HandlerRegistry};
use crate::task::{SharedRegistry, TaskRegistry, TaskStore};

/// The agent process: identity, task state, and the control-plane session.
pub struct Agent {
    pub config: AgentConfig,
    pub identity: Arc<AgentIdentity>,
    pub roster: Roster,
    pub tasks: SharedRegistry,
    pub store: Arc<TaskStore>,
}

impl Agent {
    /// Validate configuration, load the agent id and open the task store.
    ///
    /// Tasks a previous process left running are marked failed.
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let identity = AgentIdentity::load_or_create(&config.identity_path)?;
        Self::with_identity(config, identity)
    }

    /// Like [`Agent::new`] with an identity supplied by the caller.
    pub fn with_identity(config: AgentConfig, identity: AgentIdentity) -> Result<Self> {
        config.validate()?;
        let roster = Roster::from_urls(&config.servers)?;
        let store = TaskStore::open(&config.store_path)?;
        store.recover_interrupted()?;

        tracing::info!(
            agent_id = %identity.id,
            host = %identity.host_name,
            servers = roster.len(),
            "Agent initialised"
        );

        Ok(Self {
            config,
            identity: Arc::new(identity),
            roster,
            tasks: Arc::new(RwLock::new(TaskRegistry::new())),
            store: Arc::new(store),
        })
    }

    pub fn handlers(&self) -> Result<HandlerRegistry> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("fleet-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let mut registry = HandlerRegistry::new();
        handlers::register_all(
            &mut registry,
            self.tasks.clone(),
            self.store.clone(),
            self.config.platform.clone(),
            http,
        )?;
        Ok(registry)
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Builds the handler table (a duplicate type is fatal)
    /// 2. Picks the least-loaded reachable server (none reachable is fatal)
    /// 3. Starts the dispatch workers and the session loops
    /// 4. On shutdown, stops live scripts and waits for the workers
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let registry = self.handlers()?;
        registry.log_registered();

        let (dispatcher, inbound) = Dispatcher::new(registry, self.config.dispatch.queue_capacity);

        let (server, ws) = select_best(
            &self.roster,
            &self.identity.id,
            self.config.connection.probe_timeout,
        )
        .await?;

        let session = Arc::new(Session::new(
            self.identity.clone(),
            server,
            self.config.connection.clone(),
            inbound,
            Some(ws),
        ));

        let workers = dispatcher.spawn_workers(
            session.handle(),
            self.config.dispatch.workers,
            shutdown.clone(),
        );
        tracing::info!(workers = workers.len(), "Dispatch workers started");

        let outcome = session.run(shutdown.clone()).await;
        shutdown.cancel();

        for task in self.tasks.read().await.snapshot().values() {
            task.stop();
        }
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Dispatch worker ended abnormally");
            }
        }

        tracing::info!("Agent stopped");
        outcome
    }
}
