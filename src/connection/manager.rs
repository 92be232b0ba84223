use crate::error::StoreError;
use crate::store::driver::{StoreBackend, StoreConnection};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Explicit handle of one execution context (typically one inbound request).
///
/// Clones refer to the same context. Once closed, a context can no longer acquire
/// connections.
#[derive(Clone)]
pub struct ExecutionContext {
    id: Uuid,
    closed: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Slot {
    connection: Arc<dyn StoreConnection>,
    holders: usize,
}

struct Registry {
    backend: Arc<dyn StoreBackend>,
    slots: DashMap<Uuid, Slot>,
    shut_down: AtomicBool,
}

impl Registry {
    fn release(&self, context: Uuid) {
        let last_holder = match self.slots.get_mut(&context) {
            Some(mut slot) => {
                slot.holders = slot.holders.saturating_sub(1);
                slot.holders == 0
            }
            None => false,
        };

        if last_holder
            && let Some((_, slot)) = self.slots.remove_if(&context, |_, slot| slot.holders == 0)
        {
            slot.connection.close();
            tracing::debug!("Closed store connection of context {}", context);
        }
    }
}

/// A store connection borrowed by one holder of an execution context.
///
/// Dropping the handle is the release: the underlying connection is closed once the last
/// handle of its context is gone.
pub struct Connection {
    context: Uuid,
    connection: Arc<dyn StoreConnection>,
    registry: Arc<Registry>,
}

impl Connection {
    pub fn context_id(&self) -> Uuid {
        self.context
    }
}

impl Deref for Connection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.release(self.context);
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    registry: Arc<Registry>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            registry: Arc::new(Registry {
                backend,
                slots: DashMap::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the context's connection, opening it on first use.
    pub async fn acquire(&self, context: &ExecutionContext) -> Result<Connection, StoreError> {
        if context.is_closed() || self.registry.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::ContextClosed);
        }

        if let Some(mut slot) = self.registry.slots.get_mut(&context.id()) {
            slot.holders += 1;
            return Ok(self.handle(context, slot.connection.clone()));
        }

        // Connect outside the map so a slow store never blocks other contexts.
        let fresh = self.registry.backend.connect().await?;
        let connection = match self.registry.slots.entry(context.id()) {
            Entry::Occupied(mut occupied) => {
                fresh.close();
                let slot = occupied.get_mut();
                slot.holders += 1;
                slot.connection.clone()
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    connection: fresh.clone(),
                    holders: 1,
                });
                tracing::debug!("Opened store connection for context {}", context.id());
                fresh
            }
        };

        Ok(self.handle(context, connection))
    }

    fn handle(
        &self,
        context: &ExecutionContext,
        connection: Arc<dyn StoreConnection>,
    ) -> Connection {
        Connection {
            context: context.id(),
            connection,
            registry: self.registry.clone(),
        }
    }

    /// Gives a handle back. Equivalent to dropping it.
    pub fn release(&self, connection: Connection) {
        drop(connection);
    }

    /// Ends a context: closes its connection whatever the number of outstanding handles
    /// and refuses further acquisitions on it.
    pub fn end_context(&self, context: &ExecutionContext) {
        context.mark_closed();
        if let Some((_, slot)) = self.registry.slots.remove(&context.id()) {
            slot.connection.close();
        }
    }

    /// Closes every cached connection. Used at process teardown.
    pub fn shutdown_all(&self) {
        self.registry.shut_down.store(true, Ordering::SeqCst);

        let contexts: Vec<Uuid> = self.registry.slots.iter().map(|slot| *slot.key()).collect();
        for context in contexts {
            if let Some((_, slot)) = self.registry.slots.remove(&context) {
                slot.connection.close();
            }
        }
        tracing::info!("Closed all store connections");
    }

    pub fn open_connections(&self) -> usize {
        self.registry.slots.len()
    }

    pub fn holders(&self, context: &ExecutionContext) -> usize {
        self.registry
            .slots
            .get(&context.id())
            .map(|slot| slot.holders)
            .unwrap_or(0)
    }
}
