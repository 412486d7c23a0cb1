use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::storage::treewalk::WalkReceiver;

/// Identity of a listing continuation: a walker parked under these
/// parameters can serve the next page of exactly this enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListParams {
    pub bucket: String,
    pub recursive: bool,
    pub marker: String,
    pub prefix: String,
    pub heal: bool,
}

#[derive(Debug)]
struct ParkedWalk {
    id: u64,
    rx: WalkReceiver,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct PoolInner {
    walks: HashMap<ListParams, Vec<ParkedWalk>>,
    parked: usize,
    next_id: u64,
}

/// Cache of paused tree-walkers keyed by listing parameters, so a repeated
/// listing with an advanced marker resumes in O(1) filesystem work.
///
/// Each parked walker has an idle reaper: after `timeout` without a
/// matching release, its cancel token fires and the entry is dropped. The
/// pool also bounds the total number of parked walkers, evicting the
/// oldest when a park would exceed the bound.
#[derive(Debug)]
pub struct TreeWalkPool {
    inner: Mutex<PoolInner>,
    timeout: Duration,
    max_parked: usize,
}

impl TreeWalkPool {
    pub fn new(timeout: Duration, max_parked: usize) -> Arc<Self> {
        Arc::new(TreeWalkPool {
            inner: Mutex::new(PoolInner {
                walks: HashMap::new(),
                parked: 0,
                next_id: 0,
            }),
            timeout,
            max_parked: max_parked.max(1),
        })
    }

    /// Hands back a parked walker for `params`, or `None` on a cache miss.
    pub fn release(&self, params: &ListParams) -> Option<(WalkReceiver, CancellationToken)> {
        let mut inner = self.inner.lock().ok()?;
        let walks = inner.walks.get_mut(params)?;
        let entry = walks.pop()?;
        if walks.is_empty() {
            inner.walks.remove(params);
        }
        inner.parked -= 1;
        Some((entry.rx, entry.cancel))
    }

    /// Parks a partially consumed walker under `params` (whose marker must
    /// already be the last key handed out) and arms its idle reaper.
    pub fn park(
        self: &Arc<Self>,
        params: ListParams,
        rx: WalkReceiver,
        cancel: CancellationToken,
    ) {
        let id = {
            let Ok(mut inner) = self.inner.lock() else {
                cancel.cancel();
                return;
            };
            if inner.parked >= self.max_parked {
                evict_oldest(&mut inner);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.parked += 1;
            inner.walks.entry(params.clone()).or_default().push(ParkedWalk {
                id,
                rx,
                cancel: cancel.clone(),
            });
            id
        };

        let pool = Arc::downgrade(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            reap(&pool, &params, id, &cancel);
        });
    }

    /// Cancels and drops every walker parked for `bucket`; used when the
    /// bucket is deleted out from under its listings.
    pub fn evict_bucket(&self, bucket: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let keys: Vec<ListParams> = inner
            .walks
            .keys()
            .filter(|p| p.bucket == bucket)
            .cloned()
            .collect();
        for key in keys {
            if let Some(walks) = inner.walks.remove(&key) {
                inner.parked -= walks.len();
                for walk in walks {
                    walk.cancel.cancel();
                }
            }
        }
    }

    /// Cancels and drops everything; the pool stays usable but empty.
    pub fn shutdown(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for (_, walks) in inner.walks.drain() {
            for walk in walks {
                walk.cancel.cancel();
            }
        }
        inner.parked = 0;
    }

    #[cfg(test)]
    fn parked_count(&self) -> usize {
        self.inner.lock().unwrap().parked
    }
}

fn evict_oldest(inner: &mut PoolInner) {
    let oldest = inner
        .walks
        .iter()
        .flat_map(|(params, walks)| walks.iter().map(|w| (w.id, params.clone())))
        .min_by_key(|(id, _)| *id);
    let Some((id, params)) = oldest else {
        return;
    };
    if let Some(walk) = remove_walk(inner, &params, id) {
        walk.cancel.cancel();
    }
}

fn reap(pool: &Weak<TreeWalkPool>, params: &ListParams, id: u64, cancel: &CancellationToken) {
    if let Some(pool) = pool.upgrade() {
        if let Ok(mut inner) = pool.inner.lock() {
            // Gone already means a release beat the timer; nothing to do.
            if remove_walk(&mut inner, params, id).is_none() {
                return;
            }
        }
    }
    cancel.cancel();
}

fn remove_walk(inner: &mut PoolInner, params: &ListParams, id: u64) -> Option<ParkedWalk> {
    let walks = inner.walks.get_mut(params)?;
    let idx = walks.iter().position(|w| w.id == id)?;
    let walk = walks.remove(idx);
    if walks.is_empty() {
        inner.walks.remove(params);
    }
    inner.parked -= 1;
    Some(walk)
}
