use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{AgentError, Result};
use crate::protocol::{Context, Handler, ResponseCode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: String,
    /// Unix seconds
    pub mod_time: i64,
    pub is_dir: bool,
}

impl FileInfo {
    pub async fn stat(path: &Path) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        let mod_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            size: meta.len(),
            mode: mode_string(&meta),
            mod_time,
            is_dir: meta.is_dir(),
        })
    }
}

/// `ls -l` style mode, e.g. `-rwxr-xr-x`.
#[cfg(unix)]
fn mode_string(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode();
    let kind = if meta.is_dir() { 'd' } else { '-' };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
fn mode_string(meta: &std::fs::Metadata) -> String {
    let kind = if meta.is_dir() { 'd' } else { '-' };
    let write = if meta.permissions().readonly() { '-' } else { 'w' };
    format!("{}r{}-", kind, write)
}

#[derive(Debug, Deserialize)]
struct PathRequest {
    path: String,
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    src: String,
    dest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub dest_path: String,
    #[serde(default)]
    pub auto_create_dir: bool,
    #[serde(default)]
    pub overwrite_existed: bool,
    /// Seconds; 0 means no limit
    #[serde(default)]
    pub timeout: u64,
}

/// Decode the payload or answer with an error response.
async fn bind_or_reject<T: serde::de::DeserializeOwned>(ctx: &Context) -> Result<T> {
    match ctx.bind::<T>() {
        Ok(req) => Ok(req),
        Err(e) => {
            ctx.json_error(ResponseCode::Error, &format!("invalid request: {}", e))
                .await?;
            Err(e)
        }
    }
}

pub struct GetFileInfoHandler;

#[async_trait]
impl Handler for GetFileInfoHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let req: PathRequest = bind_or_reject(ctx).await?;
        match FileInfo::stat(Path::new(&req.path)).await {
            Ok(info) => ctx.json_success(&info).await,
            Err(e) => ctx.json_error(ResponseCode::Error, &e.to_string()).await,
        }
    }
}

pub struct DeleteFileHandler;

#[async_trait]
impl Handler for DeleteFileHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let req: PathRequest = bind_or_reject(ctx).await?;
        match tokio::fs::remove_file(&req.path).await {
            Ok(()) => {
                tracing::info!(path = %req.path, "File deleted");
                ctx.respond(ResponseCode::Success, "ok", None).await
            }
            Err(e) => ctx.json_error(ResponseCode::Error, &e.to_string()).await,
        }
    }
}

pub struct MoveFileHandler;

#[async_trait]
impl Handler for MoveFileHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let req: MoveRequest = bind_or_reject(ctx).await?;
        match tokio::fs::rename(&req.src, &req.dest).await {
            Ok(()) => {
                tracing::info!(src = %req.src, dest = %req.dest, "File moved");
                ctx.respond(ResponseCode::Success, "ok", None).await
            }
            Err(e) => ctx.json_error(ResponseCode::Error, &e.to_string()).await,
        }
    }
}

/// Fetches a URL into a local path over HTTP GET.
pub struct DownloadFileHandler {
    client: reqwest::Client,
}

impl DownloadFileHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Run one download. Timeouts surface as [`AgentError::Timeout`].
    pub async fn download(&self, req: &DownloadRequest) -> Result<u64> {
        let dest = PathBuf::from(&req.dest_path);
        if req.auto_create_dir {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if !req.overwrite_existed && tokio::fs::try_exists(&dest).await? {
            return Err(AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!(
                    "{} already exists and overwriteExisted is false",
                    dest.display()
                ),
            )));
        }

        let limit = (req.timeout > 0).then(|| Duration::from_secs(req.timeout));
        let fetch = self.fetch(&req.url, &dest);
        match limit {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .unwrap_or(Err(AgentError::Timeout(limit))),
            None => fetch.await,
        }
    }

    /// Stream the body into a sibling temp file and move it over `dest` only
    /// once complete. A failed or dropped fetch leaves `dest` untouched.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;

        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let (file, partial) = tempfile::Builder::new()
            .prefix(".fleet-download-")
            .tempfile_in(&dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        partial.persist(dest).map_err(|e| AgentError::Io(e.error))?;
        Ok(written)
    }
}

#[async_trait]
impl Handler for DownloadFileHandler {
    async fn handle(&self, ctx: &Context) -> Result<()> {
        let req: DownloadRequest = bind_or_reject(ctx).await?;

        let outcome = tokio::select! {
            outcome = self.download(&req) => outcome,
            _ = ctx.cancellation().cancelled() => Err(AgentError::Timeout(
                ctx.message.deadline().unwrap_or_default(),
            )),
        };

        match outcome {
            Ok(bytes) => {
                tracing::info!(url = %req.url, dest = %req.dest_path, bytes, "Download finished");
                ctx.respond(ResponseCode::Success, "ok", None).await
            }
            Err(AgentError::Timeout(limit)) => {
                tracing::warn!(url = %req.url, limit = ?limit, "Download timed out");
                ctx.json_error(ResponseCode::Timeout, "download timed out").await
            }
            Err(AgentError::Http(e)) if e.is_timeout() => {
                ctx.json_error(ResponseCode::Timeout, &e.to_string()).await
            }
            Err(e) => {
                tracing::warn!(url = %req.url, error = %e, "Download failed");
                ctx.json_error(ResponseCode::Error, &e.to_string()).await
            }
        }
    }
}
