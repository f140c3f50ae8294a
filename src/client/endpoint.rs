use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::server::NodeHandle;
use crate::types::*;

/// One server as seen by the coordinator. Transport failures are `Err`;
/// protocol rejections travel inside the `MutationResult`.
#[async_trait]
pub trait NomadEndpoint: Send + Sync {
    fn address(&self) -> &str;
    async fn discover(&self) -> Result<DiscoverResponse>;
    async fn prepare(&self, message: PrepareMessage) -> Result<MutationResult>;
    async fn commit(&self, message: CommitMessage) -> Result<MutationResult>;
    async fn rollback(&self, message: RollbackMessage) -> Result<MutationResult>;
    async fn takeover(&self, message: TakeoverMessage) -> Result<MutationResult>;
}

pub struct HttpEndpoint {
    addr: ServerAddr,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(addr: impl Into<ServerAddr>) -> Self {
        Self::with_client(addr, reqwest::Client::new())
    }

    pub fn with_client(addr: impl Into<ServerAddr>, client: reqwest::Client) -> Self {
        Self {
            addr: addr.into(),
            client,
        }
    }

    async fn send_rpc<Req, Resp>(&self, path: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{}/nomad/{}", self.addr, path);

        let response = self.client.post(&url).json(req).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("HTTP error from {}: {} {}", self.addr, status, body));
        }

        Ok(response.json().await?)
    }

    async fn send_mutation<Req: Serialize + Sync>(&self, path: &str, req: &Req) -> Result<MutationResult> {
        let response: AcceptRejectResponse = self.send_rpc(path, req).await?;
        Ok(response.into())
    }
}

#[async_trait]
impl NomadEndpoint for HttpEndpoint {
    fn address(&self) -> &str {
        &self.addr
    }

    async fn discover(&self) -> Result<DiscoverResponse> {
        self.send_rpc("discover", &serde_json::json!({})).await
    }

    async fn prepare(&self, message: PrepareMessage) -> Result<MutationResult> {
        self.send_mutation("prepare", &message).await
    }

    async fn commit(&self, message: CommitMessage) -> Result<MutationResult> {
        self.send_mutation("commit", &message).await
    }

    async fn rollback(&self, message: RollbackMessage) -> Result<MutationResult> {
        self.send_mutation("rollback", &message).await
    }

    async fn takeover(&self, message: TakeoverMessage) -> Result<MutationResult> {
        self.send_mutation("takeover", &message).await
    }
}

/// Talks to a node actor running in the same process.
pub struct LocalEndpoint {
    addr: ServerAddr,
    node: NodeHandle,
}

impl LocalEndpoint {
    pub fn new(addr: impl Into<ServerAddr>, node: NodeHandle) -> Self {
        Self {
            addr: addr.into(),
            node,
        }
    }
}

#[async_trait]
impl NomadEndpoint for LocalEndpoint {
    fn address(&self) -> &str {
        &self.addr
    }

    async fn discover(&self) -> Result<DiscoverResponse> {
        Ok(self.node.discover().await?)
    }

    async fn prepare(&self, message: PrepareMessage) -> Result<MutationResult> {
        Ok(self.node.prepare(message).await?)
    }

    async fn commit(&self, message: CommitMessage) -> Result<MutationResult> {
        Ok(self.node.commit(message).await?)
    }

    async fn rollback(&self, message: RollbackMessage) -> Result<MutationResult> {
        Ok(self.node.rollback(message).await?)
    }

    async fn takeover(&self, message: TakeoverMessage) -> Result<MutationResult> {
        Ok(self.node.takeover(message).await?)
    }
}
