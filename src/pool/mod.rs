// src/pool/mod.rs
//
// Process-wide pool of open raster sources with LRU eviction.
//
// The pool shares a single re-entrant mutex across every operation,
// including the opens and closes it performs itself: opening a source
// may construct proxy datasets for auxiliary files, which re-enter the
// pool on the same thread. Two separate locks would deadlock there.

mod entry;

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, error};

use crate::config::PoolConfig;
use crate::rid::{self, Rid};
use crate::source::{AccessMode, OpenFlags, SharedSource, Source, SourceOpener};

use entry::EntryList;

/// Failures surfaced by [`ref_dataset`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every slot is pinned by a live reference. The pool does not
    /// retry; the caller is running more concurrent refs than the pool
    /// has slots, or proxies are cascaded too deeply.
    #[error(
        "too many threads are running for the current size of the dataset pool ({max_size}), \
         or too many proxy datasets are opened in a cascaded way; \
         try raising MAX_DATASET_POOL_SIZE"
    )]
    Exhausted { max_size: usize },

    /// The opener failed for this path. The underlying error has been
    /// logged; the cache slot keeps the path as an empty shell.
    #[error("failed to open source {path}")]
    OpenFailed { path: String },
}

struct DatasetPool {
    max_size: usize,
    list: EntryList,
    /// Top-level references, one per proxy dataset created outside the
    /// pool's own opens and closes.
    ref_count: i64,
    /// Nonzero while the pool itself is opening or closing a source.
    /// Top-level ref/unref are no-ops inside that window, so proxies
    /// constructed by a cascaded open cannot pin the pool forever.
    suppress_ref_count: i64,
}

impl DatasetPool {
    fn new(max_size: usize) -> Self {
        DatasetPool {
            max_size,
            list: EntryList::new(),
            ref_count: 0,
            suppress_ref_count: 0,
        }
    }
}

impl Drop for DatasetPool {
    fn drop(&mut self) {
        for index in 0..self.list.len() {
            let entry = self.list.get_mut(index);
            debug_assert_eq!(entry.ref_count, 0);
            let owner = entry.rid;
            if let Some(handle) = entry.handle.take() {
                // Close as the thread that opened it.
                let _rid = rid::impersonate(owner);
                drop(handle);
            }
        }
    }
}

type PoolCell = RefCell<Option<DatasetPool>>;
type PoolGuard<'a> = ReentrantMutexGuard<'a, PoolCell>;

static POOL: ReentrantMutex<PoolCell> = ReentrantMutex::new(RefCell::new(None));
static OPENER: Mutex<Option<Arc<dyn SourceOpener>>> = Mutex::new(None);
static CONFIG: Mutex<Option<PoolConfig>> = Mutex::new(None);

/// Install the opener the pool uses for all underlying sources.
/// Replaces any previously registered opener.
pub fn register_opener(opener: Arc<dyn SourceOpener>) {
    *OPENER.lock() = Some(opener);
}

/// Store the pool configuration. It takes effect when the singleton is
/// (re)created; an already-running pool keeps its size.
pub fn configure(config: PoolConfig) {
    *CONFIG.lock() = Some(config);
}

fn configured_max_size() -> usize {
    CONFIG
        .lock()
        .clone()
        .unwrap_or_else(PoolConfig::from_env)
        .effective_max_pool_size()
}

/// A live reference to a cached open source. Dropping it releases the
/// reference; the source stays open in the pool until evicted or
/// explicitly closed. Holders must not stash the shared handle beyond
/// the guard's lifetime.
pub struct SourceRef {
    index: usize,
    source: SharedSource,
}

impl std::fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRef").field("index", &self.index).finish()
    }
}

impl SourceRef {
    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Box<dyn Source>> {
        self.source.lock()
    }
}

impl Drop for SourceRef {
    fn drop(&mut self) {
        let guard = POOL.lock();
        unref_index(&guard, self.index);
    }
}

/// Take a top-level reference on the pool, creating it lazily.
/// No-op while the pool is performing an open or close itself.
pub(crate) fn ref_pool() {
    let guard = POOL.lock();
    let mut slot = guard.borrow_mut();
    let pool = slot.get_or_insert_with(|| {
        let max_size = configured_max_size();
        debug!(max_size, "creating dataset pool");
        DatasetPool::new(max_size)
    });
    if pool.suppress_ref_count == 0 {
        pool.ref_count += 1;
    }
}

/// Release a top-level reference; the pool is destroyed (closing every
/// cached source under its recorded responsible identity) when the last
/// reference goes away. No-op inside a suppress window, matching
/// [`ref_pool`].
pub(crate) fn unref_pool() {
    let guard = POOL.lock();
    let dying = {
        let mut slot = guard.borrow_mut();
        let destroy = match slot.as_mut() {
            // Already being torn down; closes triggered by the teardown
            // land here.
            None => false,
            Some(pool) => {
                if pool.suppress_ref_count == 0 {
                    pool.ref_count -= 1;
                    pool.ref_count == 0
                } else {
                    false
                }
            }
        };
        if destroy {
            slot.take()
        } else {
            None
        }
    };
    // Dropped with the borrow released: closing sources can re-enter.
    drop(dying);
}

/// Teardown hook: keep the pool alive through refcount-driven
/// destruction until [`force_destroy`] runs.
pub fn prevent_destroy() {
    let guard = POOL.lock();
    if let Some(pool) = guard.borrow_mut().as_mut() {
        pool.suppress_ref_count += 1;
    };
}

/// Teardown hook: destroy the pool regardless of outstanding top-level
/// references. Pairs with [`prevent_destroy`].
pub fn force_destroy() {
    let guard = POOL.lock();
    let dying = {
        let mut slot = guard.borrow_mut();
        if let Some(pool) = slot.as_mut() {
            pool.suppress_ref_count -= 1;
            debug_assert_eq!(pool.suppress_ref_count, 0);
            pool.ref_count = 0;
        }
        slot.take()
    };
    drop(dying);
}

/// Teardown hook: abandon the singleton without closing anything. Used
/// when process teardown ordering has already invalidated the sources.
pub fn nullify_singleton() {
    let guard = POOL.lock();
    if let Some(pool) = guard.borrow_mut().take() {
        std::mem::forget(pool);
    };
}

enum Plan {
    Hit(usize),
    Open {
        index: usize,
        close_first: Option<(SharedSource, Rid)>,
    },
}

/// Reference the cached source for `path`, opening it if necessary.
///
/// A `shared` reference joins an existing entry opened under the same
/// responsible identity (its refcount may exceed 1); an exclusive
/// reference only takes entries that currently have no users. On a miss
/// the pool opens the source, evicting the least recently used idle
/// entry when full.
///
/// An entry whose open failed stays in the list with its path and no
/// handle; same-identity shared lookups keep hitting it (and keep
/// failing) until the shell is recycled by eviction.
pub fn ref_dataset(
    path: &str,
    access: AccessMode,
    open_options: &[String],
    shared: bool,
) -> Result<SourceRef, PoolError> {
    let guard = POOL.lock();
    let rid = rid::current();

    let plan = {
        let mut slot = guard.borrow_mut();
        let pool = slot.get_or_insert_with(|| DatasetPool::new(configured_max_size()));

        let mut matched = None;
        let mut last_idle = None;
        for (index, entry) in pool.list.iter() {
            if entry.path == path
                && ((shared && entry.rid == rid) || (!shared && entry.ref_count == 0))
            {
                matched = Some(index);
                break;
            }
            if entry.ref_count == 0 {
                last_idle = Some(index);
            }
        }

        match matched {
            Some(index) => {
                pool.list.move_to_front(index);
                pool.list.get_mut(index).ref_count += 1;
                Plan::Hit(index)
            }
            None if pool.list.len() < pool.max_size => {
                let index = pool.list.push_front(path.to_string(), access, rid, 1);
                Plan::Open {
                    index,
                    close_first: None,
                }
            }
            None => {
                let Some(victim) = last_idle else {
                    error!(max_size = pool.max_size, "dataset pool exhausted");
                    return Err(PoolError::Exhausted {
                        max_size: pool.max_size,
                    });
                };
                // Recycle the least recently used idle entry. The slot
                // takes its new identity before the old handle is
                // closed, so a re-entrant lookup during the close
                // cannot claim it a second time.
                let entry = pool.list.get_mut(victim);
                let owner = entry.rid;
                let close_first = entry.handle.take().map(|handle| (handle, owner));
                entry.path = path.to_string();
                entry.access = access;
                entry.rid = rid;
                entry.ref_count = 1;
                pool.list.move_to_front(victim);
                Plan::Open {
                    index: victim,
                    close_first,
                }
            }
        }
    };

    match plan {
        Plan::Hit(index) => {
            let handle = {
                let slot = guard.borrow();
                slot.as_ref().and_then(|pool| pool.list.get(index).handle.clone())
            };
            match handle {
                Some(source) => Ok(SourceRef { index, source }),
                None => {
                    // The cached entry is a failed-open shell.
                    unref_index(&guard, index);
                    Err(PoolError::OpenFailed {
                        path: path.to_string(),
                    })
                }
            }
        }
        Plan::Open { index, close_first } => {
            if let Some((handle, owner)) = close_first {
                debug!(path, %owner, "evicting cached source");
                close_handle(&guard, handle, owner);
            }

            let opener = OPENER.lock().clone();
            adjust_suppress(&guard, 1);
            let opened = match opener {
                Some(opener) => opener.open(path, OpenFlags::for_access(access), open_options),
                None => Err(anyhow::anyhow!("no source opener registered")),
            };
            adjust_suppress(&guard, -1);

            match opened {
                Ok(source) => {
                    let source: SharedSource = Arc::new(Mutex::new(source));
                    if let Some(pool) = guard.borrow_mut().as_mut() {
                        pool.list.get_mut(index).handle = Some(source.clone());
                    }
                    debug!(path, ?access, "opened source");
                    Ok(SourceRef { index, source })
                }
                Err(err) => {
                    error!(path, error = %err, "failed to open source");
                    unref_index(&guard, index);
                    Err(PoolError::OpenFailed {
                        path: path.to_string(),
                    })
                }
            }
        }
    }
}

/// Close the cached source for `path` if it is idle, leaving the entry
/// behind as a reusable shell. The access mode is accepted for symmetry
/// with [`ref_dataset`] but is not part of the lookup. No-op when there
/// is nothing to close.
pub fn close_dataset(path: &str, _access: AccessMode) {
    let guard = POOL.lock();
    let to_close = {
        let mut slot = guard.borrow_mut();
        let Some(pool) = slot.as_mut() else {
            return;
        };
        let mut found = None;
        for (index, entry) in pool.list.iter() {
            if entry.path == path && entry.ref_count == 0 && entry.handle.is_some() {
                found = Some(index);
                break;
            }
        }
        found.and_then(|index| {
            let entry = pool.list.get_mut(index);
            entry.path.clear();
            let owner = entry.rid;
            entry.handle.take().map(|handle| (handle, owner))
        })
    };
    if let Some((handle, owner)) = to_close {
        debug!(path, %owner, "closing cached source");
        close_handle(&guard, handle, owner);
    }
}

fn unref_index(guard: &PoolGuard<'_>, index: usize) {
    let mut slot = guard.borrow_mut();
    let Some(pool) = slot.as_mut() else {
        return;
    };
    let entry = pool.list.get_mut(index);
    debug_assert!(entry.ref_count > 0);
    entry.ref_count = entry.ref_count.saturating_sub(1);
}

/// Drop `handle` under the identity that opened it, inside a suppress
/// window. The pool cell borrow must be released on entry: the drop can
/// cascade into proxy destructors that re-enter the pool.
fn close_handle(guard: &PoolGuard<'_>, handle: SharedSource, owner: Rid) {
    adjust_suppress(guard, 1);
    {
        let _rid = rid::impersonate(owner);
        drop(handle);
    }
    adjust_suppress(guard, -1);
}

fn adjust_suppress(guard: &PoolGuard<'_>, delta: i64) {
    if let Some(pool) = guard.borrow_mut().as_mut() {
        pool.suppress_ref_count += delta;
        debug_assert!(pool.suppress_ref_count >= 0);
    }
}

/// Aggregate pool counters, taken under the pool mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub max_size: usize,
    pub ref_count: i64,
    pub suppress_ref_count: i64,
}

/// Snapshot of one cache entry, for debugging and tests.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub path: String,
    pub access: AccessMode,
    pub rid: Rid,
    pub ref_count: u32,
    pub open: bool,
}

/// Counters of the live pool, or `None` if no pool exists.
pub fn stats() -> Option<PoolStats> {
    let guard = POOL.lock();
    let slot = guard.borrow();
    slot.as_ref().map(|pool| PoolStats {
        size: pool.list.len(),
        max_size: pool.max_size,
        ref_count: pool.ref_count,
        suppress_ref_count: pool.suppress_ref_count,
    })
}

/// The pool's entries in MRU→LRU order. Empty if no pool exists.
pub fn contents() -> Vec<EntrySnapshot> {
    let guard = POOL.lock();
    let slot = guard.borrow();
    match slot.as_ref() {
        None => Vec::new(),
        Some(pool) => pool
            .list
            .iter()
            .map(|(_, entry)| EntrySnapshot {
                path: entry.path.clone(),
                access: entry.access,
                rid: entry.rid,
                ref_count: entry.ref_count,
                open: entry.handle.is_some(),
            })
            .collect(),
    }
}
