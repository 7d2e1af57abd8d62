//! The outbound capability the naming core uses to reach a storage
//! replica's command endpoint (§4.7/§6.3): a closed, explicit
//! three-method taxonomy — `create`, `delete`, `copy` — rather than a
//! reflection-based RPC dispatch (§9 redesign flag).
//!
//! Shaped like `nfs-mamont`'s `Vfs` trait: an `#[async_trait]` interface
//! with a concrete implementation (there, an in-memory or shadow
//! filesystem; here, an HTTP client talking JSON to the replica's
//! command endpoint).

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::path::Path;

#[derive(Serialize)]
struct CreateRequest<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct CopyRequest<'a> {
    path: &'a str,
    server_ip: String,
    server_port: u16,
}

#[derive(Deserialize)]
struct CommandResponse {
    success: bool,
}

/// Outbound capability reaching a single storage replica's command
/// endpoint. At most one outstanding request per `(replica, path)` is
/// the caller's responsibility (§4.7); the dispatcher in
/// [`crate::replication`] upholds this by processing one instruction at
/// a time per replica.
#[async_trait]
pub trait CommandClient: Send + Sync {
    async fn create(&self, endpoint: SocketAddr, path: &Path) -> Result<(), CommandError>;

    async fn delete(&self, endpoint: SocketAddr, path: &Path) -> Result<(), CommandError>;

    async fn copy(
        &self,
        endpoint: SocketAddr,
        path: &Path,
        source: SocketAddr,
    ) -> Result<(), CommandError>;
}

/// HTTP/JSON implementation of [`CommandClient`], posting to
/// `http://<endpoint>/command/{create,delete,copy}` per §6.3.
pub struct HttpCommandClient {
    http: reqwest::Client,
}

impl Default for HttpCommandClient {
    fn default() -> Self {
        HttpCommandClient { http: reqwest::Client::new() }
    }
}

impl HttpCommandClient {
    pub fn new() -> Self {
        HttpCommandClient::default()
    }

    async fn post(&self, url: String, body: impl Serialize) -> Result<(), CommandError> {
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))?;
        let parsed: CommandResponse = response
            .json()
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))?;
        if parsed.success {
            Ok(())
        } else {
            Err(CommandError::Rejected)
        }
    }
}

#[async_trait]
impl CommandClient for HttpCommandClient {
    async fn create(&self, endpoint: SocketAddr, path: &Path) -> Result<(), CommandError> {
        let url = format!("http://{endpoint}/command/create");
        self.post(url, CreateRequest { path: &path.encode() }).await
    }

    async fn delete(&self, endpoint: SocketAddr, path: &Path) -> Result<(), CommandError> {
        let url = format!("http://{endpoint}/command/delete");
        self.post(url, DeleteRequest { path: &path.encode() }).await
    }

    async fn copy(
        &self,
        endpoint: SocketAddr,
        path: &Path,
        source: SocketAddr,
    ) -> Result<(), CommandError> {
        let url = format!("http://{endpoint}/command/copy");
        self.post(
            url,
            CopyRequest { path: &path.encode(), server_ip: source.ip().to_string(), server_port: source.port() },
        )
        .await
    }
}
