//! # Fastest node selection
//!
//! [`FastestNode`] keeps the latest latency sample of every monitored node and decides, on
//! every new sample, which node traffic should go to.
//!
//! A sample at least as fast as the current best takes over immediately. A slower sample can
//! only trigger a re-scan once the current best's own sample has aged past the grace period
//! (plus the slow sample's latency). The re-scan only considers recent samples, so a node that
//! stopped answering eventually loses the top spot without a single slow probe flipping it.
//!
//! Subscribers are told about a new best URL only when it actually changes.
use crate::injector::{HostInjector, HostSink, SubscriptionId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Grace period added to a sample's latency when deciding whether the best node is stale.
pub const DEFAULT_RESCAN_GRACE: Duration = Duration::from_secs(60);

/// Speed assumed for the default node before anything was measured.
const UNMEASURED_SPEED: Duration = Duration::from_secs(1_000_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub speed: Duration,
    pub sampled_at: Instant,
}

struct State {
    best_url: Option<String>,
    best_speed: Duration,
    /// `None` until the first sample; an unmeasured best is infinitely old.
    best_marked: Option<Instant>,
    records: BTreeMap<String, NodeRecord>,
    announced: bool,
    subscribers: Vec<(SubscriptionId, Weak<dyn HostSink>)>,
    next_subscription: SubscriptionId,
}

pub struct FastestNode {
    grace: Duration,
    state: Mutex<State>,
    /// Held across every fan-out. It is taken before `state` is released, so subscribers
    /// see announcements in the order they were decided.
    notify: Mutex<()>,
}

impl std::fmt::Debug for FastestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FastestNode")
            .field("best_url", &state.best_url)
            .field("best_speed", &state.best_speed)
            .field("nodes", &state.records.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl FastestNode {
    pub fn new(default_node: Option<String>) -> Self {
        Self::with_grace(default_node, DEFAULT_RESCAN_GRACE)
    }

    pub fn with_grace(default_node: Option<String>, grace: Duration) -> Self {
        FastestNode {
            grace,
            state: Mutex::new(State {
                best_url: default_node,
                best_speed: UNMEASURED_SPEED,
                best_marked: None,
                records: BTreeMap::new(),
                announced: false,
                subscribers: Vec::new(),
                next_subscription: 1,
            }),
            notify: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_notify(&self) -> MutexGuard<'_, ()> {
        self.notify.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_node_speed(&self, node: &str, speed: Duration) {
        self.set_node_speed_at(node, speed, Instant::now());
    }

    /// Records a latency sample for `node` taken at `now` and re-evaluates the best node.
    pub fn set_node_speed_at(&self, node: &str, speed: Duration, now: Instant) {
        let mut state = self.lock();
        state.records.insert(
            node.to_string(),
            NodeRecord {
                speed,
                sampled_at: now,
            },
        );

        let previous = state.best_url.clone();
        if speed <= state.best_speed {
            state.best_url = Some(node.to_string());
            state.best_speed = speed;
            state.best_marked = Some(now);
        } else {
            let window = self.grace + speed;
            let stale = match state.best_marked {
                Some(marked) => now.saturating_duration_since(marked) > window,
                None => true,
            };
            if !stale {
                return;
            }

            let mut best = (node.to_string(), speed, now);
            for (url, record) in &state.records {
                if record.speed < best.1 && now.saturating_duration_since(record.sampled_at) <= window {
                    best = (url.clone(), record.speed, record.sampled_at);
                }
            }
            tracing::debug!(node, best = %best.0, "Best node sample went stale, re-scanned");
            state.best_url = Some(best.0);
            state.best_speed = best.1;
            state.best_marked = Some(best.2);
        }

        let changed = previous != state.best_url || !state.announced;
        if !changed {
            return;
        }
        state.announced = true;
        let Some(url) = state.best_url.clone() else {
            return;
        };
        let best_speed = state.best_speed;
        let sinks = live_sinks(&mut state);
        let _fanout = self.lock_notify();
        drop(state);

        tracing::info!(url = %url, previous = ?previous, speed_ms = best_speed.as_millis() as u64, "Fastest node changed");
        for sink in sinks {
            sink.inject_host_url(&url);
        }
    }

    /// Current best URL, or the default node if nothing has been measured yet.
    pub fn best_url(&self) -> Option<String> {
        self.lock().best_url.clone()
    }

    /// Latency of the current best node, if it was ever measured.
    pub fn best_speed(&self) -> Option<Duration> {
        let state = self.lock();
        state.best_marked.map(|_| state.best_speed)
    }

    pub fn record(&self, node: &str) -> Option<NodeRecord> {
        self.lock().records.get(node).copied()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Upgrades every subscriber, dropping the ones whose owner is gone.
fn live_sinks(state: &mut State) -> Vec<Arc<dyn HostSink>> {
    let mut sinks = Vec::with_capacity(state.subscribers.len());
    state.subscribers.retain(|(_, weak)| match weak.upgrade() {
        Some(sink) => {
            sinks.push(sink);
            true
        }
        None => false,
    });
    sinks
}

impl HostInjector for FastestNode {
    fn subscribe(&self, sink: Weak<dyn HostSink>) -> SubscriptionId {
        let mut state = self.lock();
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscribers.push((id, sink.clone()));

        let current = if state.announced {
            state.best_url.clone()
        } else {
            None
        };
        let _fanout = self.lock_notify();
        drop(state);

        if let (Some(url), Some(sink)) = (current, sink.upgrade()) {
            sink.inject_host_url(&url);
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.retain(|(sid, _)| *sid != id);
    }
}
