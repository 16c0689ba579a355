//! Backend pool with weighted round-robin selection.
//!
//! The pool is held behind an `ArcSwap`, allowing lock-free reads on the
//! request path. Administrative changes (upsert, removal, health flips) build
//! a new snapshot under a mutex and swap it in; requests already holding the
//! old snapshot finish with it.
//!
//! Each snapshot carries a precomputed smooth weighted round-robin schedule
//! over its healthy backends, so `next` is a single atomic increment. With
//! equal weights the schedule is plain round-robin: A, B, A, B.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;
use url::Url;

use super::error::GatewayError;

/// One upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    url: Url,
    weight: u32,
    healthy: bool,
}

impl Backend {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    backends: Vec<Arc<Backend>>,
    /// Indexes into `backends`, one entry per unit of weight.
    schedule: Vec<usize>,
}

impl Snapshot {
    fn new(backends: Vec<Arc<Backend>>) -> Self {
        let schedule = smooth_schedule(&backends);
        Self { backends, schedule }
    }
}

/// Interleaves healthy backends in proportion to their weights.
///
/// Each round every candidate gains its weight and the leader is picked and
/// set back by the total, which spreads heavy backends out instead of
/// picking them in runs.
fn smooth_schedule(backends: &[Arc<Backend>]) -> Vec<usize> {
    let candidates: Vec<(usize, i64)> = backends
        .iter()
        .enumerate()
        .filter(|(_, b)| b.healthy && b.weight > 0)
        .map(|(i, b)| (i, i64::from(b.weight)))
        .collect();
    let total: i64 = candidates.iter().map(|(_, w)| w).sum();

    let mut current = vec![0i64; candidates.len()];
    let mut schedule = Vec::with_capacity(usize::try_from(total).unwrap_or_default());
    for _ in 0..total {
        let mut best = 0;
        for (slot, (_, weight)) in candidates.iter().enumerate() {
            current[slot] += weight;
            if current[slot] > current[best] {
                best = slot;
            }
        }
        current[best] -= total;
        schedule.push(candidates[best].0);
    }
    schedule
}

/// Set of upstream servers shared by all requests.
#[derive(Debug, Default)]
pub struct BackendPool {
    snapshot: ArcSwap<Snapshot>,
    cursor: AtomicUsize,
    writer: Mutex<()>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next healthy backend.
    pub fn next(&self) -> Result<Arc<Backend>, GatewayError> {
        let snapshot = self.snapshot.load();
        if snapshot.schedule.is_empty() {
            return Err(GatewayError::NoLiveBackends);
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.schedule.len();
        Ok(snapshot.backends[snapshot.schedule[position]].clone())
    }

    /// Adds a backend or updates the weight of an existing one. New backends
    /// start healthy; an existing backend keeps its health state.
    pub fn add_target(&self, url: Url, weight: u32) {
        self.update(|backends| {
            if let Some(existing) = backends.iter_mut().find(|b| b.url == url) {
                *existing = Arc::new(Backend {
                    weight,
                    ..(**existing).clone()
                });
            } else {
                info!(target_url = %url, weight, "backend added");
                backends.push(Arc::new(Backend {
                    url,
                    weight,
                    healthy: true,
                }));
            }
            true
        });
    }

    /// Removes a backend. Returns `false` if it was not in the pool.
    pub fn remove_target(&self, url: &Url) -> bool {
        self.update(|backends| {
            let before = backends.len();
            backends.retain(|b| &b.url != url);
            let removed = backends.len() != before;
            if removed {
                info!(target_url = %url, "backend removed");
            }
            removed
        })
    }

    /// Marks a backend healthy or unhealthy. Returns `true` if the state
    /// changed.
    pub fn set_healthy(&self, url: &Url, healthy: bool) -> bool {
        self.update(|backends| {
            let Some(existing) = backends
                .iter_mut()
                .find(|b| &b.url == url && b.healthy != healthy)
            else {
                return false;
            };
            *existing = Arc::new(Backend {
                healthy,
                ..(**existing).clone()
            });
            info!(target_url = %url, healthy, "backend health changed");
            true
        })
    }

    /// All backends, healthy or not.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.snapshot.load().backends.clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.snapshot
            .load()
            .backends
            .iter()
            .filter(|b| b.healthy)
            .count()
    }

    /// Applies `change` to a copy of the backend list and publishes it if
    /// `change` reports a modification.
    fn update(&self, change: impl FnOnce(&mut Vec<Arc<Backend>>) -> bool) -> bool {
        let _guard = self.writer.lock();
        let mut backends = self.snapshot.load().backends.clone();
        let changed = change(&mut backends);
        if changed {
            self.snapshot.store(Arc::new(Snapshot::new(backends)));
        }
        changed
    }
}
