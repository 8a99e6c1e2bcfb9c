// src/rid.rs
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Responsible identity: an opaque, stable identifier for the thread
/// that owns an open. Opens and closes performed by the pool are
/// attributed to a responsible identity rather than to whichever thread
/// happens to trigger them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid(u64);

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid:{}", self.0)
    }
}

static NEXT_RID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_RID: Cell<Option<Rid>> = const { Cell::new(None) };
}

/// The current thread's responsible identity. The slot is assigned a
/// fresh identity on first use, so the default value identifies the
/// thread itself.
pub fn current() -> Rid {
    CURRENT_RID.with(|slot| match slot.get() {
        Some(rid) => rid,
        None => {
            let rid = Rid(NEXT_RID.fetch_add(1, Ordering::Relaxed));
            slot.set(Some(rid));
            rid
        }
    })
}

/// Overwrite the current thread's responsible identity slot.
pub fn set_current(rid: Rid) {
    CURRENT_RID.with(|slot| slot.set(Some(rid)));
}

/// Temporarily impersonate another responsible identity. The previous
/// identity is restored when the guard drops.
pub fn impersonate(rid: Rid) -> RidGuard {
    let previous = current();
    set_current(rid);
    RidGuard { previous }
}

pub struct RidGuard {
    previous: Rid,
}

impl Drop for RidGuard {
    fn drop(&mut self) {
        set_current(self.previous);
    }
}
