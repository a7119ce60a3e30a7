use std::io::ErrorKind;
use std::net::{IpAddr, UdpSocket};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

const HOSTNAME_OVERRIDE_PATH: &str = "/opt/cloud/common/hostname";
const VM_UUID_PATH: &str = "/opt/cloud/common/vmuuid";

/// Registration and heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub uuid: String,
    pub host_ip: String,
    pub host_name: String,
    pub vmuuid: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    /// Unix seconds at which the payload was built
    pub heartbeat: i64,
    /// Comma-separated IPv4 addresses
    pub local_ips: String,
}

/// Stable identity of this agent plus the host facts it reports.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: String,
    pub host_name: String,
    pub host_ip: String,
    pub local_ips: Vec<String>,
    pub vm_uuid: String,
}

impl AgentIdentity {
    /// Load the cached agent id (or create and cache one) and probe host facts.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let id = load_or_create_id(path)?;
        let host_ip = outbound_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let local_ips = merge_local_ips(&host_ip, interface_ipv4s());
        Ok(Self {
            id,
            host_name: host_name(),
            host_ip,
            local_ips,
            vm_uuid: read_trimmed(Path::new(VM_UUID_PATH)).unwrap_or_default(),
        })
    }

    /// Identity with a fixed id and no host probing.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host_name: host_name(),
            host_ip: String::new(),
            local_ips: Vec::new(),
            vm_uuid: String::new(),
        }
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            uuid: self.id.clone(),
            host_ip: self.host_ip.clone(),
            host_name: self.host_name.clone(),
            vmuuid: self.vm_uuid.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat: chrono::Utc::now().timestamp(),
            local_ips: self.local_ips.join(","),
        }
    }

    pub fn client_info_value(&self) -> Value {
        serde_json::to_value(self.client_info()).unwrap_or(Value::Null)
    }
}

/// Read the agent id cached at `path`, generating and caching one if absent.
pub fn load_or_create_id(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, &id)?;
    tracing::info!(agent_id = %id, path = %path.display(), "Generated new agent id");
    Ok(id)
}

fn host_name() -> String {
    read_trimmed(Path::new(HOSTNAME_OVERRIDE_PATH)).unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default()
    })
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Address of the interface holding the default route. No packet is sent.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

/// `host_ip` first, then every other interface address, without repeats.
fn merge_local_ips(host_ip: &str, interfaces: Vec<String>) -> Vec<String> {
    let mut ips: Vec<String> = Vec::with_capacity(interfaces.len() + 1);
    for ip in std::iter::once(host_ip.to_string()).chain(interfaces) {
        if !ip.is_empty() && !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips
}

/// IPv4 addresses of every interface that is up and not loopback.
#[cfg(unix)]
fn interface_ipv4s() -> Vec<String> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list network interfaces");
            return Vec::new();
        }
    };

    let mut ips = Vec::new();
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            || !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
        {
            continue;
        }
        let Some(v4) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = v4.ip().to_string();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips
}

#[cfg(not(unix))]
fn interface_ipv4s() -> Vec<String> {
    Vec::new()
}
