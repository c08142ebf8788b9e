//! Process-wide shared state: the function registry, call accounting, and observability counters.
//!
//! A [`Services`] value is created once with [`Services::init`] and shared behind an [`Arc`] by every
//! engine and call guard that needs it. [`Services::shutdown`] clears it again.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Serialize, Deserialize};

use crate::functions::FunctionRegistry;
use crate::grid::Origin;
use crate::runtime::*;
use crate::std_util::Clock;

#[derive(Debug, Default)]
struct BottleneckStats {
    samples: AtomicU64,
    max_steps: AtomicU64,
    total_steps: AtomicU64,
}

/// A program that repeatedly did a lot of work in a single tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub origin: Origin,
    /// Number of ticks the program went over [`Settings::bottleneck_steps`].
    pub samples: u64,
    pub max_steps: u64,
    pub total_steps: u64,
}

pub struct Services {
    settings: Settings,
    registry: FunctionRegistry,
    clock: Arc<dyn Clock>,
    active_runs: AtomicUsize,
    active_calls: AtomicUsize,
    depths: DashMap<ActorId, usize>,
    suspensions: DashMap<ActorId, usize>,
    bottlenecks: DashMap<Origin, BottleneckStats>,
}
impl Services {
    pub fn init(settings: Settings, clock: Arc<dyn Clock>) -> Arc<Self> {
        tracing::info!(?settings, "services initialized");
        Arc::new(Self {
            settings,
            clock,
            registry: Default::default(),
            active_runs: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
            depths: Default::default(),
            suspensions: Default::default(),
            bottlenecks: Default::default(),
        })
    }
    /// Clears the registry and all tracking state.
    /// Runs still alive afterwards release their slots as usual when they end.
    pub fn shutdown(&self) {
        self.registry.clear();
        self.depths.clear();
        self.suspensions.clear();
        self.bottlenecks.clear();
        self.active_runs.store(0, Ordering::Relaxed);
        self.active_calls.store(0, Ordering::Relaxed);
        tracing::info!("services shut down");
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Number of runs that have started but not ended.
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::Relaxed)
    }
    /// Number of function calls that have entered their body but not ended.
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Relaxed)
    }
    /// Current call depth of the actor.
    pub fn call_depth(&self, actor: &ActorId) -> usize {
        self.depths.get(actor).map(|x| *x).unwrap_or(0)
    }
    /// Number of suspended runs of the actor.
    pub fn suspensions(&self, actor: &ActorId) -> usize {
        self.suspensions.get(actor).map(|x| *x).unwrap_or(0)
    }
    /// All recorded bottlenecks, worst first.
    pub fn bottlenecks(&self) -> Vec<Bottleneck> {
        let mut res = self.bottlenecks.iter().map(|x| Bottleneck {
            origin: x.key().clone(),
            samples: x.samples.load(Ordering::Relaxed),
            max_steps: x.max_steps.load(Ordering::Relaxed),
            total_steps: x.total_steps.load(Ordering::Relaxed),
        }).collect::<Vec<_>>();
        res.sort_by(|a, b| b.max_steps.cmp(&a.max_steps).then_with(|| a.origin.cmp(&b.origin)));
        res
    }

    pub(crate) fn run_started(&self) {
        self.active_runs.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn run_ended(&self) {
        let _ = self.active_runs.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| x.checked_sub(1));
    }

    /// Claims a suspension slot for the actor.
    pub(crate) fn suspend(&self, actor: &ActorId) -> Result<(), ResourceLimitError> {
        let limit = self.settings.max_suspensions_per_actor;
        let mut count = self.suspensions.entry(actor.clone()).or_insert(0);
        if *count >= limit {
            return Err(ResourceLimitError::Suspensions { actor: actor.clone(), limit });
        }
        *count += 1;
        Ok(())
    }
    /// Releases a suspension slot claimed by [`Services::suspend`].
    pub(crate) fn resume(&self, actor: &ActorId) {
        self.suspensions.remove_if_mut(actor, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    /// Claims a depth slot for the actor and a unit of the global call budget.
    /// Depth is checked first, so a too-deep call never touches the global budget.
    pub(crate) fn enter_call(&self, actor: &ActorId, max_depth: usize, function: &CompactString) -> Result<(), ResourceLimitError> {
        let mut depth = self.depths.entry(actor.clone()).or_insert(0);
        if *depth >= max_depth {
            return Err(ResourceLimitError::CallDepth { function: function.clone(), limit: max_depth });
        }
        let limit = self.settings.max_active_calls;
        if self.active_calls.fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| (x < limit).then_some(x + 1)).is_err() {
            drop(depth);
            self.depths.remove_if(actor, |_, depth| *depth == 0);
            return Err(ResourceLimitError::Concurrency { limit });
        }
        *depth += 1;
        Ok(())
    }
    /// Releases the slots claimed by [`Services::enter_call`].
    pub(crate) fn leave_call(&self, actor: &ActorId) {
        self.depths.remove_if_mut(actor, |_, depth| {
            *depth = depth.saturating_sub(1);
            *depth == 0
        });
        let _ = self.active_calls.fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| x.checked_sub(1));
    }

    /// Records how many steps a run took in one tick, if it is enough to count as a bottleneck.
    pub(crate) fn record_steps(&self, origin: &Origin, steps: u64) {
        if steps < self.settings.bottleneck_steps as u64 {
            return;
        }
        let stats = self.bottlenecks.entry(origin.clone()).or_default();
        stats.samples.fetch_add(1, Ordering::Relaxed);
        stats.max_steps.fetch_max(steps, Ordering::Relaxed);
        stats.total_steps.fetch_add(steps, Ordering::Relaxed);
        tracing::debug!(origin = %origin, steps, "bottleneck sample");
    }
}
