use crate::clock::StepConfig;
use crate::engine::{CognitiveEngine, EngineMetrics};
use crate::executor::ExecutorMetrics;
use crate::profiler::{DomainStats, WorkerStats};
use crate::stream::StreamSummary;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A read-only snapshot of what the engine is doing.
///
/// Design intent:
/// - Observers cannot steer the engine; they only read.
/// - Snapshotting is on demand and waits for queued work to settle first, so
///   call it between ticks rather than from inside a task.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineSnapshot {
    pub step: u8,
    pub cycle: u64,
    pub step_config: StepConfig,
    pub is_sync_point: bool,
    pub streams: Vec<StreamSummary>,
    pub aggregate_coherence: f64,
    pub last_sync_quality: f64,
    pub metrics: EngineMetrics,
    pub executor: ExecutorMetrics,
}

pub struct EngineAdapter<'a> {
    engine: &'a CognitiveEngine,
}

impl<'a> EngineAdapter<'a> {
    pub fn new(engine: &'a CognitiveEngine) -> Self {
        Self { engine }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let clock = self.engine.clock();
        let metrics = self.engine.metrics();
        EngineSnapshot {
            step: clock.step(),
            cycle: clock.cycle_count(),
            step_config: *clock.config(),
            is_sync_point: clock.is_sync_point(),
            streams: self.engine.stream_snapshots(),
            aggregate_coherence: self.engine.aggregate_coherence(),
            last_sync_quality: metrics.last_sync_quality,
            metrics,
            executor: self.engine.executor_metrics(),
        }
    }

    pub fn profile(&self) -> ProfileSnapshot {
        let profiler = self.engine.executor().profiler();
        ProfileSnapshot {
            workers: profiler.worker_stats(),
            domains: profiler.domain_stats(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProfileSnapshot {
    pub workers: Vec<WorkerStats>,
    pub domains: Vec<DomainStats>,
}
