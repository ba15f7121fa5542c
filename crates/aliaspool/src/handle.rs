//! Allocator actor: one command loop per process owning the registry connection.
//!
//! Callers talk to a cloneable [`AllocatorHandle`]. Commands are queued on an
//! mpsc channel and answered over oneshot channels; the loop runs on a
//! blocking thread because registry calls are synchronous and may wait on the
//! store's busy timeout. Commands are processed strictly in arrival order, so
//! two callers in the same process never race each other.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::allocator::{AllocError, Allocator};
use crate::config::{AllocatorConfig, RegistryConfig};
use crate::pool::PoolSource;
use crate::registry::{Allocation, Registry, SqliteRegistry};
use crate::resolver::ConsumerKeyResolver;
use crate::slot::{ConsumerKey, Slot};

const COMMAND_QUEUE_DEPTH: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, AllocError>>;

enum Command {
    GetOrAllocate { key: ConsumerKey, reply: Reply<Slot> },
    Release { key: ConsumerKey, reply: Reply<Option<Allocation>> },
    List { reply: Reply<Vec<Allocation>> },
    Info { key: ConsumerKey, reply: Reply<Option<Allocation>> },
}

#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Command>,
}

impl AllocatorHandle {
    /// Move `allocator` onto its own blocking thread and return a handle to it.
    ///
    /// Must be called from within a tokio runtime. The loop exits once every
    /// handle has been dropped.
    pub fn spawn<R>(allocator: Allocator<R>) -> Self
    where
        R: Registry + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::task::spawn_blocking(move || run_command_loop(allocator, rx));
        Self { tx }
    }

    /// Open the SQLite registry, start an allocator on it and spawn the loop.
    pub async fn open(
        registry: RegistryConfig,
        config: AllocatorConfig,
        source: Arc<dyn PoolSource>,
    ) -> Result<Self, AllocError> {
        let allocator = tokio::task::spawn_blocking(move || -> Result<_, AllocError> {
            let registry = SqliteRegistry::open(&registry)?;
            Allocator::start(registry, source.as_ref(), config)
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Allocator startup task failed");
            AllocError::Closed
        })??;

        Ok(Self::spawn(allocator))
    }

    pub async fn get_or_allocate(&self, key: ConsumerKey) -> Result<Slot, AllocError> {
        self.request(|reply| Command::GetOrAllocate { key, reply }).await
    }

    /// Resolve the current consumer key and allocate for it.
    pub async fn allocate_current(
        &self,
        resolver: &dyn ConsumerKeyResolver,
    ) -> Result<(ConsumerKey, Slot), AllocError> {
        let key = resolver.current_consumer_key()?;
        let slot = self.get_or_allocate(key.clone()).await?;
        Ok((key, slot))
    }

    pub async fn release(&self, key: ConsumerKey) -> Result<Option<Allocation>, AllocError> {
        self.request(|reply| Command::Release { key, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<Allocation>, AllocError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn info(&self, key: ConsumerKey) -> Result<Option<Allocation>, AllocError> {
        self.request(|reply| Command::Info { key, reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, AllocError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| AllocError::Closed)?;
        reply_rx.await.map_err(|_| AllocError::Closed)?
    }
}

fn run_command_loop<R: Registry>(mut allocator: Allocator<R>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::GetOrAllocate { key, reply } => {
                let result = allocator.get_or_allocate(&key);
                if let Err(ref e) = result {
                    tracing::warn!(consumer = %key, error = %e, "Allocation failed");
                }
                let _ = reply.send(result);
            }
            Command::Release { key, reply } => {
                let _ = reply.send(allocator.release(&key));
            }
            Command::List { reply } => {
                let _ = reply.send(allocator.list());
            }
            Command::Info { key, reply } => {
                let _ = reply.send(allocator.info(&key));
            }
        }
    }
    tracing::debug!("Allocator command loop exiting");
}
