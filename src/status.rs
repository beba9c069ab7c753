//! Shared up/down state and the health aggregate over all of it.
//!
//! Every discovery source and every reconciler owns one [`StatusHandle`].
//! Owners mutate it after each cycle; the health endpoint and the metrics
//! collector read it through [`StatusAggregator`], which always takes the
//! locks in the same order: sources in registration order, then adapters
//! in registration order.

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub up: bool,
    /// Published group count per metrics label.
    pub target_counts: BTreeMap<String, i64>,
}

pub type StatusHandle = Arc<Mutex<Status>>;

pub fn new_handle() -> StatusHandle {
    Arc::new(Mutex::new(Status::default()))
}

/// Point-in-time copy of every registered status.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub sources: Vec<(String, Status)>,
    pub adapters: Vec<(String, Status)>,
}

#[derive(Default)]
pub struct StatusAggregator {
    sources: Vec<(String, StatusHandle)>,
    adapters: Vec<(String, StatusHandle)>,
}

/// Holds a set of guards and releases them in reverse acquisition order.
struct LockSet<'a> {
    guards: Vec<MutexGuard<'a, Status>>,
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, name: impl Into<String>, handle: StatusHandle) {
        self.sources.push((name.into(), handle));
    }

    pub fn add_adapter(&mut self, name: impl Into<String>, handle: StatusHandle) {
        self.adapters.push((name.into(), handle));
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn lock_all(&self) -> LockSet<'_> {
        let mut guards = Vec::with_capacity(self.sources.len() + self.adapters.len());
        for (_, handle) in &self.sources {
            guards.push(handle.lock());
        }
        for (_, handle) in &self.adapters {
            guards.push(handle.lock());
        }
        LockSet { guards }
    }

    /// True when every source and every adapter is up.
    ///
    /// With no sources registered the system is reported unhealthy.
    pub fn is_healthy(&self) -> bool {
        if self.sources.is_empty() {
            return false;
        }
        let locked = self.lock_all();
        locked.guards.iter().all(|status| status.up)
    }

    /// Consistent copy of all statuses, taken under the full lock set.
    pub fn report(&self) -> StatusReport {
        let locked = self.lock_all();
        let (sources, adapters) = locked.guards.split_at(self.sources.len());
        StatusReport {
            sources: self
                .sources
                .iter()
                .zip(sources)
                .map(|((name, _), status)| (name.clone(), (**status).clone()))
                .collect(),
            adapters: self
                .adapters
                .iter()
                .zip(adapters)
                .map(|((name, _), status)| (name.clone(), (**status).clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn handle(up: bool) -> StatusHandle {
        let h = new_handle();
        h.lock().up = up;
        h
    }

    #[test]
    fn empty_aggregator_is_unhealthy() {
        assert!(!StatusAggregator::new().is_healthy());
    }

    #[test]
    fn one_down_source_makes_system_unhealthy() {
        let mut agg = StatusAggregator::new();
        agg.add_source("ironic", handle(true));
        agg.add_source("netbox", handle(false));
        assert!(!agg.is_healthy());
    }

    #[test]
    fn all_up_is_healthy() {
        let mut agg = StatusAggregator::new();
        agg.add_source("ironic", handle(true));
        agg.add_source("netbox", handle(true));
        agg.add_adapter("ironic", handle(true));
        assert!(agg.is_healthy());
    }

    #[test]
    fn down_adapter_makes_system_unhealthy() {
        let mut agg = StatusAggregator::new();
        agg.add_source("ironic", handle(true));
        agg.add_adapter("ironic", handle(false));
        assert!(!agg.is_healthy());
    }

    #[test]
    fn report_copies_counts() {
        let source = handle(true);
        source.lock().target_counts.insert("bm".into(), 3);
        let mut agg = StatusAggregator::new();
        agg.add_source("ironic", source);
        agg.add_adapter("ironic", handle(false));

        let report = agg.report();
        assert_eq!(report.sources.len(), 1);
        assert_eq!(report.sources[0].1.target_counts["bm"], 3);
        assert_eq!(report.adapters[0].0, "ironic");
        assert!(!report.adapters[0].1.up);
    }

    #[test]
    fn concurrent_health_checks_do_not_deadlock() {
        let a = handle(true);
        let b = handle(true);
        let mut agg = StatusAggregator::new();
        agg.add_source("a", a.clone());
        agg.add_source("b", b.clone());
        agg.add_adapter("a", handle(true));
        let agg = Arc::new(agg);

        let mut workers = Vec::new();
        for i in 0..8 {
            let agg = agg.clone();
            let (a, b) = (a.clone(), b.clone());
            workers.push(thread::spawn(move || {
                for n in 0..500 {
                    if i % 2 == 0 {
                        agg.is_healthy();
                    } else {
                        a.lock().up = n % 2 == 0;
                        b.lock().up = true;
                        agg.report();
                    }
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        a.lock().up = true;
        assert!(agg.is_healthy());
    }
}
