use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ChangeApplicator, ConfigServer};
use crate::error::ServerError;
use crate::types::*;

type Reply<T> = oneshot::Sender<Result<T, ServerError>>;

/// Every message the node actor understands.
pub enum NodeRequest {
    Discover(Reply<DiscoverResponse>),
    Prepare(PrepareMessage, Reply<MutationResult>),
    Commit(CommitMessage, Reply<MutationResult>),
    Rollback(RollbackMessage, Reply<MutationResult>),
    Takeover(TakeoverMessage, Reply<MutationResult>),
    CurrentConfig(Reply<Option<Configuration>>),
    History(Reply<Vec<ChangeDetails>>),
}

impl NodeRequest {
    fn label(&self) -> &'static str {
        match self {
            NodeRequest::Discover(_) => "discover",
            NodeRequest::Prepare(..) => "prepare",
            NodeRequest::Commit(..) => "commit",
            NodeRequest::Rollback(..) => "rollback",
            NodeRequest::Takeover(..) => "takeover",
            NodeRequest::CurrentConfig(_) => "current-config",
            NodeRequest::History(_) => "history",
        }
    }
}

/// Cloneable sender side of a running node actor.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeRequest>,
}

impl NodeHandle {
    pub async fn discover(&self) -> Result<DiscoverResponse, ServerError> {
        self.call(NodeRequest::Discover).await
    }

    pub async fn prepare(&self, message: PrepareMessage) -> Result<MutationResult, ServerError> {
        self.call(|reply| NodeRequest::Prepare(message, reply)).await
    }

    pub async fn commit(&self, message: CommitMessage) -> Result<MutationResult, ServerError> {
        self.call(|reply| NodeRequest::Commit(message, reply)).await
    }

    pub async fn rollback(&self, message: RollbackMessage) -> Result<MutationResult, ServerError> {
        self.call(|reply| NodeRequest::Rollback(message, reply)).await
    }

    pub async fn takeover(&self, message: TakeoverMessage) -> Result<MutationResult, ServerError> {
        self.call(|reply| NodeRequest::Takeover(message, reply)).await
    }

    pub async fn current_config(&self) -> Result<Option<Configuration>, ServerError> {
        self.call(NodeRequest::CurrentConfig).await
    }

    pub async fn history(&self) -> Result<Vec<ChangeDetails>, ServerError> {
        self.call(NodeRequest::History).await
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> NodeRequest) -> Result<T, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ServerError::Unavailable("node actor has stopped".to_string()))?;
        rx.await
            .map_err(|_| ServerError::Unavailable("node actor dropped the request".to_string()))?
    }
}

/// Moves the server onto a dedicated blocking task. Ledger writes fsync, so
/// the actor never runs on the async workers.
pub fn spawn_node<A>(mut server: ConfigServer<A>) -> NodeHandle
where
    A: ChangeApplicator + 'static,
{
    let (tx, mut rx) = mpsc::channel::<NodeRequest>(64);

    tokio::task::spawn_blocking(move || {
        info!("Node actor started");
        while let Some(request) = rx.blocking_recv() {
            debug!("Handling {} request", request.label());
            dispatch(&mut server, request);
        }
        info!("Node actor stopped");
    });

    NodeHandle { tx }
}

fn dispatch<A: ChangeApplicator>(server: &mut ConfigServer<A>, request: NodeRequest) {
    let delivered = match request {
        NodeRequest::Discover(reply) => reply.send(server.discover()).is_ok(),
        NodeRequest::Prepare(message, reply) => reply.send(server.prepare(&message)).is_ok(),
        NodeRequest::Commit(message, reply) => reply.send(server.commit(&message)).is_ok(),
        NodeRequest::Rollback(message, reply) => reply.send(server.rollback(&message)).is_ok(),
        NodeRequest::Takeover(message, reply) => reply.send(server.takeover(&message)).is_ok(),
        NodeRequest::CurrentConfig(reply) => reply.send(server.current_committed_config()).is_ok(),
        NodeRequest::History(reply) => reply.send(server.change_history()).is_ok(),
    };

    if !delivered {
        warn!("Caller went away before the node replied");
    }
}
