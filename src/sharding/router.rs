//! Fixed shard topology and per-shard query execution

use super::{ShardConnection, ShardId};
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle to one shard of the topology
#[derive(Clone)]
pub struct ShardHandle {
    id: ShardId,
    connection: Arc<dyn ShardConnection>,
    router_closed: Arc<AtomicBool>,
}

impl ShardHandle {
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Underlying connection, shared with every other holder of this handle
    pub fn connection(&self) -> Arc<dyn ShardConnection> {
        Arc::clone(&self.connection)
    }

    /// Run a query against this shard unless the router has been closed
    pub async fn execute<F, Fut, T>(&self, query: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn ShardConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.router_closed.load(Ordering::Acquire) {
            return Err(Error::RouterClosed);
        }
        query(self.connection()).await
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("id", &self.id)
            .field("closed", &self.connection.is_closed())
            .finish()
    }
}

/// Owns the shard connections for the lifetime of the process
///
/// The shard count is fixed at construction. A shard that cannot be reached
/// stays in the topology; only its health changes.
pub struct ShardRouter {
    handles: Vec<ShardHandle>,
    closed: Arc<AtomicBool>,
}

impl ShardRouter {
    /// Create a router over `connections`, where position `i` is shard `i`
    pub fn new(connections: Vec<Arc<dyn ShardConnection>>) -> Result<Self> {
        if connections.is_empty() {
            return Err(Error::Config(
                "shard router needs at least one shard".to_string(),
            ));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(connections.len());
        for (id, connection) in connections.into_iter().enumerate() {
            if connection.shard_id() != id {
                return Err(Error::Config(format!(
                    "connection at position {} reports shard id {}",
                    id,
                    connection.shard_id()
                )));
            }
            handles.push(ShardHandle {
                id,
                connection,
                router_closed: Arc::clone(&closed),
            });
        }

        info!("Shard router initialized with {} shards", handles.len());
        Ok(Self { handles, closed })
    }

    pub fn shard_count(&self) -> usize {
        self.handles.len()
    }

    /// All shard handles, ordered by shard id
    pub fn handles(&self) -> &[ShardHandle] {
        &self.handles
    }

    /// Handle for one shard
    pub fn handle(&self, shard_id: ShardId) -> Result<ShardHandle> {
        if self.is_closed() {
            return Err(Error::RouterClosed);
        }
        self.handles
            .get(shard_id)
            .cloned()
            .ok_or(Error::ShardNotFound(shard_id))
    }

    /// Run a query against a shard
    pub async fn execute<F, Fut, T>(&self, shard_id: ShardId, query: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn ShardConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.handle(shard_id)?.execute(query).await
    }

    /// Close every shard connection
    ///
    /// Idempotent. All connections are closed even if some fail; the first
    /// failure is returned. Must not be called while a health loop or a
    /// migration is still using these shards.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for handle in &self.handles {
            if let Err(e) = handle.connection.close().await {
                warn!(shard_id = handle.id, "Failed to close shard connection: {}", e);
                first_error.get_or_insert(e);
            }
        }

        info!("Shard router closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
