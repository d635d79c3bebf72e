// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded pool of backing-store client handles.
//!
//! Each [`ConnectionPool::acquire`] is routed to the handle with the fewest
//! outstanding users. When every handle is busy and the pool is below its
//! ceiling, a new handle is connected on demand. [`ConnectionPool::maintain`]
//! reclaims handles that have sat idle past the timeout with nobody using
//! them, never going below the retained floor.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::TaskEngineConfig;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{RecordStore, StorageError};

/// Opens a new backing-store handle.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RecordStore>, StorageError>;

    fn name(&self) -> &str {
        "store"
    }
}

/// Hands out the same store for every handle (in-memory and test setups).
pub struct SharedStoreConnector {
    store: Arc<dyn RecordStore>,
}

impl SharedStoreConnector {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreConnector for SharedStoreConnector {
    async fn connect(&self) -> Result<Arc<dyn RecordStore>, StorageError> {
        Ok(self.store.clone())
    }

    fn name(&self) -> &str {
        "shared"
    }
}

/// Opens a fresh [`SqlStore`] per handle.
pub struct SqlConnector {
    url: String,
    max_connections: u32,
}

impl SqlConnector {
    pub fn new(url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            url: url.into(),
            max_connections,
        }
    }
}

#[async_trait]
impl StoreConnector for SqlConnector {
    async fn connect(&self) -> Result<Arc<dyn RecordStore>, StorageError> {
        let store = SqlStore::new(&self.url, self.max_connections).await?;
        Ok(Arc::new(store))
    }

    fn name(&self) -> &str {
        "sql"
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_clients: usize,
    /// Handles retained by maintenance regardless of idleness
    pub min_clients: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_clients: 10,
            min_clients: 2,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&TaskEngineConfig> for PoolConfig {
    fn from(config: &TaskEngineConfig) -> Self {
        Self {
            max_clients: config.pool_max_clients.max(1),
            min_clients: config.pool_min_clients,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    /// Handles with at least one outstanding user
    pub in_use: usize,
    /// Outstanding users across all handles
    pub outstanding: usize,
    pub created: u64,
    pub reclaimed: u64,
}

struct Slot {
    id: u64,
    store: Arc<dyn RecordStore>,
    usage: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl Slot {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }
}

/// Store handle checked out of the pool. Dereferences to the store and
/// returns itself on drop.
pub struct PooledClient {
    slot: Arc<Slot>,
}

impl PooledClient {
    #[must_use]
    pub fn handle_id(&self) -> u64 {
        self.slot.id
    }
}

impl Deref for PooledClient {
    type Target = dyn RecordStore;

    fn deref(&self) -> &Self::Target {
        self.slot.store.as_ref()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.slot.usage.fetch_sub(1, Ordering::AcqRel);
        *self.slot.last_used.lock() = Instant::now();
    }
}

/// Handles plus connects still in flight. Both count against `max_clients`.
#[derive(Default)]
struct Handles {
    slots: Vec<Arc<Slot>>,
    connecting: usize,
}

impl Handles {
    fn reserved(&self) -> usize {
        self.slots.len() + self.connecting
    }
}

enum Checkout {
    Use(Arc<Slot>),
    /// A connect was reserved; share `fallback` if it fails.
    Grow { fallback: Option<Arc<Slot>> },
    /// No handle yet, but one is being connected.
    Wait,
    Empty,
}

/// A reserved connect. Releases the reservation if the connect fails or
/// the acquiring future is dropped mid-connect.
struct PendingConnect<'a> {
    pool: &'a ConnectionPool,
    settled: bool,
}

impl<'a> PendingConnect<'a> {
    fn new(pool: &'a ConnectionPool) -> Self {
        Self { pool, settled: false }
    }

    /// Release the reservation, adding `slot` unless the pool closed meanwhile.
    fn settle(mut self, slot: Option<Arc<Slot>>) -> bool {
        self.settled = true;
        let mut handles = self.pool.handles.lock();
        handles.connecting = handles.connecting.saturating_sub(1);
        let added = match slot {
            Some(slot) if !self.pool.is_closed() => {
                handles.slots.push(slot);
                crate::metrics::set_pool_size(handles.slots.len());
                true
            }
            _ => false,
        };
        drop(handles);
        self.pool.grown.notify_waiters();
        added
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let mut handles = self.pool.handles.lock();
            handles.connecting = handles.connecting.saturating_sub(1);
            drop(handles);
            self.pool.grown.notify_waiters();
        }
    }
}

fn closed_error() -> StorageError {
    StorageError::Backend("connection pool is closed".to_string())
}

pub struct ConnectionPool {
    connector: Arc<dyn StoreConnector>,
    config: PoolConfig,
    handles: Mutex<Handles>,
    grown: Notify,
    next_id: AtomicU64,
    created: AtomicU64,
    reclaimed: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn StoreConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            handles: Mutex::new(Handles::default()),
            grown: Notify::new(),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool over a single shared store.
    pub fn shared(store: Arc<dyn RecordStore>, config: PoolConfig) -> Self {
        Self::new(Arc::new(SharedStoreConnector::new(store)), config)
    }

    /// Open `min_clients` handles up front.
    pub async fn warm_up(&self) -> Result<usize, StorageError> {
        let target = self.config.min_clients.min(self.config.max_clients);
        loop {
            {
                let mut handles = self.handles.lock();
                if handles.reserved() >= target {
                    break;
                }
                handles.connecting += 1;
            }
            let pending = PendingConnect::new(self);
            let slot = self.connect_slot().await?;
            if !pending.settle(Some(slot)) {
                return Err(closed_error());
            }
        }
        Ok(self.handles.lock().slots.len())
    }

    async fn connect_slot(&self) -> Result<Arc<Slot>, StorageError> {
        let store = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(connector = self.connector.name(), handle = id, "Pool handle created");
        Ok(Arc::new(Slot {
            id,
            store,
            usage: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }))
    }

    /// Pick the least-used handle, or reserve a connect if every handle is
    /// busy and the pool has room. The lock is never held across a connect.
    fn plan_checkout(&self) -> Checkout {
        let mut handles = self.handles.lock();
        let least = handles
            .slots
            .iter()
            .min_by_key(|s| s.usage.load(Ordering::Acquire))
            .cloned();
        let busy = least
            .as_ref()
            .map(|s| s.usage.load(Ordering::Acquire) > 0)
            .unwrap_or(true);

        if busy && handles.reserved() < self.config.max_clients {
            handles.connecting += 1;
            return Checkout::Grow { fallback: least };
        }
        match least {
            Some(slot) => Checkout::Use(slot),
            None if handles.connecting > 0 => Checkout::Wait,
            None => Checkout::Empty,
        }
    }

    async fn grow(&self, fallback: Option<Arc<Slot>>) -> Result<Arc<Slot>, StorageError> {
        let pending = PendingConnect::new(self);
        match self.connect_slot().await {
            Ok(slot) => {
                if pending.settle(Some(slot.clone())) {
                    Ok(slot)
                } else {
                    Err(closed_error())
                }
            }
            Err(e) => {
                pending.settle(None);
                match fallback {
                    Some(existing) => {
                        warn!(error = %e, "Pool growth failed; sharing an existing handle");
                        Ok(existing)
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Check out the least-used handle, growing the pool if all are busy.
    ///
    /// While one caller connects a new handle, others keep sharing the
    /// existing ones instead of queueing behind the connect.
    pub async fn acquire(&self) -> Result<PooledClient, StorageError> {
        let slot = loop {
            if self.is_closed() {
                return Err(closed_error());
            }
            let grown = self.grown.notified();
            match self.plan_checkout() {
                Checkout::Use(slot) => break slot,
                Checkout::Grow { fallback } => break self.grow(fallback).await?,
                Checkout::Wait => grown.await,
                Checkout::Empty => {
                    return Err(StorageError::Backend("connection pool has no handles".to_string()))
                }
            }
        };

        slot.usage.fetch_add(1, Ordering::AcqRel);
        *slot.last_used.lock() = Instant::now();
        Ok(PooledClient { slot })
    }

    /// Reclaim idle handles with no users, keeping at least `min_clients`.
    /// Returns the number reclaimed.
    pub async fn maintain(&self) -> usize {
        let now = Instant::now();
        let mut handles = self.handles.lock();
        let slots = &mut handles.slots;
        let floor = self.config.min_clients;
        let mut removable = slots.len().saturating_sub(floor);
        let before = slots.len();

        slots.retain(|slot| {
            let idle = slot.usage.load(Ordering::Acquire) == 0 && slot.idle_for(now) >= self.config.idle_timeout;
            if idle && removable > 0 {
                removable -= 1;
                false
            } else {
                true
            }
        });

        let reclaimed = before - slots.len();
        if reclaimed > 0 {
            self.reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
            info!(reclaimed, remaining = slots.len(), "Idle pool handles reclaimed");
        }
        crate::metrics::set_pool_size(slots.len());
        reclaimed
    }

    pub async fn stats(&self) -> PoolStats {
        let handles = self.handles.lock();
        let slots = &handles.slots;
        let usages: Vec<usize> = slots.iter().map(|s| s.usage.load(Ordering::Acquire)).collect();
        PoolStats {
            total: slots.len(),
            in_use: usages.iter().filter(|u| **u > 0).count(),
            outstanding: usages.iter().sum(),
            created: self.created.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Drop every handle and refuse further checkouts. Outstanding clients
    /// keep their handle until dropped.
    pub async fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut handles = self.handles.lock();
        let released = handles.slots.len();
        handles.slots.clear();
        crate::metrics::set_pool_size(0);
        info!(released, "Connection pool closed");
        released
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
