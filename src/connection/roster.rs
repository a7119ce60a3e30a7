use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::http::Uri;

use crate::error::{AgentError, Result};

/// Last observed state of a control-plane endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerLoad {
    pub load: i64,
    pub checked: bool,
}

/// A candidate control-plane endpoint.
#[derive(Debug)]
pub struct Server {
    url: String,
    state: Mutex<ServerLoad>,
}

impl Server {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let uri: Uri = url
            .parse()
            .map_err(|e| AgentError::Config(format!("invalid server url {}: {}", url, e)))?;
        match uri.scheme_str() {
            Some("ws") | Some("wss") => {}
            _ => {
                return Err(AgentError::Config(format!(
                    "server url {} must use ws:// or wss://",
                    url
                )))
            }
        }
        Ok(Self {
            url,
            state: Mutex::new(ServerLoad::default()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Endpoint the agent dials: the configured url with the agent id appended.
    pub fn dial_url(&self, agent_id: &str) -> String {
        format!("{}{}", self.url, agent_id)
    }

    pub async fn record_load(&self, load: i64) {
        let mut state = self.state.lock().await;
        state.load = load;
        state.checked = true;
    }

    pub async fn mark_unreachable(&self) {
        self.state.lock().await.checked = false;
    }

    pub async fn load(&self) -> ServerLoad {
        *self.state.lock().await
    }
}

/// Static list of configured endpoints, in configuration order.
#[derive(Debug, Clone)]
pub struct Roster {
    servers: Vec<Arc<Server>>,
}

impl Roster {
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Self> {
        if urls.is_empty() {
            return Err(AgentError::Config("server roster is empty".to_string()));
        }
        let servers = urls
            .iter()
            .map(|u| Server::new(u.as_ref()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { servers })
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
