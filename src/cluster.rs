//! Cluster membership types and the coordinator client seam.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Coordinator-assigned identity of one server in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "server {}", self.0)
    }
}

/// Liveness of a server according to the membership updates seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Up,
    Crashed,
}

/// Kind of membership transition reported by the cluster server list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The server joined the cluster.
    Added,
    /// The server crashed; its replicas must be re-replicated.
    Crashed,
    /// The server left the list after an earlier crash.
    Removed,
}

/// One membership transition. On `Removed` events only the id is
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerChange {
    pub server_id: ServerId,
    pub kind: ChangeKind,
}

impl ServerChange {
    pub fn new(server_id: ServerId, kind: ChangeKind) -> Self {
        Self { server_id, kind }
    }
}

/// Client seam to the cluster coordinator.
#[async_trait::async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Enlist this backup under `locator` and obtain its server id.
    /// Failure here is fatal to startup.
    async fn register(&self, locator: &str) -> Result<ServerId>;

    /// Subscribe to the coordinator's server list. The stream yields one
    /// [`ServerChange`] per membership transition and ends when the
    /// coordinator connection does; the failure monitor's tracker is fed
    /// from it.
    async fn subscribe_membership(&self) -> Result<mpsc::Receiver<ServerChange>>;
}
