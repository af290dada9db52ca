//! Load-time configuration for the engine.
//!
//! There is no hot reload: changing any of this means building a new engine.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::clock::{StepType, StreamKind, SyncPolicy, STEPS_PER_CYCLE};
use crate::error::ConfigError;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::reservoir::ReservoirConfig;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamConfig {
    pub name: String,
    pub kind: StreamKind,
    /// Steps this stream runs ahead of the shared clock, in [0, 12).
    pub phase_offset: u8,
    #[cfg_attr(feature = "serde", serde(default))]
    pub reservoir: ReservoirConfig,
}

impl StreamConfig {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            phase_offset: kind.default_phase_offset(),
            reservoir: ReservoirConfig::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_phase_offset(mut self, offset: u8) -> Self {
        self.phase_offset = offset;
        self
    }

    pub fn with_reservoir(mut self, reservoir: ReservoirConfig) -> Self {
        self.reservoir = reservoir;
        self
    }
}

/// The reference triad: pivotal/0, affordance/4, salience/8, distinct seeds.
pub fn default_streams() -> Vec<StreamConfig> {
    [StreamKind::Pivotal, StreamKind::Affordance, StreamKind::Salience]
        .into_iter()
        .enumerate()
        .map(|(i, kind)| {
            let reservoir = ReservoirConfig::default().with_seed(DEFAULT_SEED + i as u64);
            StreamConfig::new(kind).with_reservoir(reservoir)
        })
        .collect()
}

const DEFAULT_SEED: u64 = 0xEC40_BEA7;

/// Rendezvous activation coupling by the step type being synced on.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepCoupling {
    pub pivotal: f64,
    pub affordance: f64,
    pub salience: f64,
}

impl Default for StepCoupling {
    /// Pivotal steps pull hardest, affordance steps least.
    fn default() -> Self {
        Self {
            pivotal: 0.5,
            affordance: 0.3,
            salience: 0.4,
        }
    }
}

impl StepCoupling {
    pub fn strength(&self, step_type: StepType) -> f64 {
        match step_type {
            StepType::Pivotal => self.pivotal,
            StepType::Affordance => self.affordance,
            StepType::Salience => self.salience,
        }
    }
}

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 8)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Wall-clock length of one full 12-step cycle.
    pub cycle_duration_secs: f64,

    pub worker_count: usize,

    /// Activation blend toward the triad mean at a rendezvous, in [0, 1].
    pub coupling_strength: f64,

    /// Per-step-type activation coupling. Replaces `coupling_strength` when set.
    pub step_coupling: Option<StepCoupling>,

    /// State-vector blend toward the participants' mean state, in [0, 1].
    pub state_coupling: f64,

    /// Unfinished tasks the executor accepts before `submit` fails. Must
    /// cover at least one task per stream, since a step is queued whole.
    pub max_pending_tasks: usize,

    /// Rendezvous and step wait bound. `None` means twice the step duration.
    pub barrier_timeout_ms: Option<u64>,

    pub sync_policy: SyncPolicy,

    /// Micro-ticks per step for co-running a finer clock.
    pub subdivision: u32,

    /// Finished task records kept for `record` lookups.
    pub completed_retention: usize,

    /// Let non-rendezvous steps overlap with the next step's updates.
    pub pipeline_non_sync_steps: bool,

    /// Relevance at or above which a pivotal step is reported as realized.
    pub relevance_threshold: f64,

    pub profiling: bool,

    /// Per-subscriber event queue bound.
    pub event_capacity: usize,

    pub streams: Vec<StreamConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_duration_secs: 12.0,
            worker_count: default_worker_count(),
            coupling_strength: 0.3,
            step_coupling: None,
            state_coupling: 0.1,
            max_pending_tasks: 256,
            barrier_timeout_ms: None,
            sync_policy: SyncPolicy::GroupStart,
            subdivision: 1,
            completed_retention: 1024,
            pipeline_non_sync_steps: false,
            relevance_threshold: 0.5,
            profiling: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            streams: default_streams(),
        }
    }
}

impl EngineConfig {
    pub fn with_cycle_duration(mut self, secs: f64) -> Self {
        self.cycle_duration_secs = secs;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_coupling(mut self, coupling_strength: f64) -> Self {
        self.coupling_strength = coupling_strength;
        self
    }

    pub fn with_step_coupling(mut self, coupling: StepCoupling) -> Self {
        self.step_coupling = Some(coupling);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_state_coupling(mut self, state_coupling: f64) -> Self {
        self.state_coupling = state_coupling;
        self
    }

    pub fn with_max_pending(mut self, max_pending_tasks: usize) -> Self {
        self.max_pending_tasks = max_pending_tasks;
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    pub fn with_subdivision(mut self, subdivision: u32) -> Self {
        self.subdivision = subdivision;
        self
    }

    pub fn with_pipelining(mut self, enabled: bool) -> Self {
        self.pipeline_non_sync_steps = enabled;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    pub fn with_streams(mut self, streams: Vec<StreamConfig>) -> Self {
        self.streams = streams;
        self
    }

    /// Re-seed every stream's reservoir from one base seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        for (i, stream) in self.streams.iter_mut().enumerate() {
            stream.reservoir.seed = seed.wrapping_add(i as u64);
        }
        self
    }

    /// Apply the same adjustment to every stream's reservoir.
    pub fn map_reservoirs(mut self, f: impl Fn(ReservoirConfig) -> ReservoirConfig) -> Self {
        for stream in &mut self.streams {
            stream.reservoir = f(stream.reservoir.clone());
        }
        self
    }

    /// Activation coupling applied at a rendezvous on a step of `step_type`.
    pub fn coupling_for(&self, step_type: StepType) -> f64 {
        self.step_coupling
            .map_or(self.coupling_strength, |c| c.strength(step_type))
    }

    pub fn cycle_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.cycle_duration_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn step_duration(&self) -> Duration {
        self.cycle_duration() / STEPS_PER_CYCLE as u32
    }

    pub fn barrier_timeout(&self) -> Duration {
        match self.barrier_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.step_duration().saturating_mul(2),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if self.streams[..i].iter().any(|s| s.name == stream.name) {
                return Err(ConfigError::DuplicateStream {
                    name: stream.name.clone(),
                });
            }
            if stream.phase_offset >= STEPS_PER_CYCLE {
                return Err(ConfigError::PhaseOffset {
                    stream: stream.name.clone(),
                    offset: stream.phase_offset,
                });
            }
            stream.reservoir.validate()?;
        }
        if !(self.cycle_duration_secs > 0.0 && Duration::try_from_secs_f64(self.cycle_duration_secs).is_ok()) {
            return Err(ConfigError::out_of_range(
                "cycle_duration_secs",
                self.cycle_duration_secs,
                "> 0 and representable as a Duration",
            ));
        }
        unit_interval("coupling_strength", self.coupling_strength)?;
        if let Some(c) = &self.step_coupling {
            unit_interval("step_coupling.pivotal", c.pivotal)?;
            unit_interval("step_coupling.affordance", c.affordance)?;
            unit_interval("step_coupling.salience", c.salience)?;
        }
        unit_interval("state_coupling", self.state_coupling)?;
        unit_interval("relevance_threshold", self.relevance_threshold)?;
        if self.worker_count == 0 {
            return Err(ConfigError::Zero {
                field: "worker_count",
            });
        }
        if self.max_pending_tasks == 0 {
            return Err(ConfigError::Zero {
                field: "max_pending_tasks",
            });
        }
        check_step_capacity(self.max_pending_tasks, self.streams.len())?;
        if self.subdivision == 0 {
            return Err(ConfigError::Zero {
                field: "subdivision",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "event_capacity",
            });
        }
        Ok(())
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[cfg(feature = "serde")]
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    #[cfg(feature = "serde")]
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// A step's stream tasks are queued together, so the pending bound has to fit them.
pub fn check_step_capacity(max_pending_tasks: usize, streams: usize) -> Result<(), ConfigError> {
    if max_pending_tasks < streams {
        Err(ConfigError::out_of_range(
            "max_pending_tasks",
            max_pending_tasks as f64,
            "at least one slot per stream",
        ))
    } else {
        Ok(())
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, value, "[0, 1]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.streams.len(), 3);
        let offsets: Vec<u8> = cfg.streams.iter().map(|s| s.phase_offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert!((2..=8).contains(&cfg.worker_count));
        assert_eq!(cfg.step_duration(), Duration::from_secs(1));
        assert_eq!(cfg.barrier_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let cases: Vec<(EngineConfig, &str)> = vec![
            (EngineConfig::default().with_streams(Vec::new()), "stream"),
            (EngineConfig::default().with_coupling(1.5), "coupling_strength"),
            (EngineConfig::default().with_workers(0), "worker_count"),
            (EngineConfig::default().with_max_pending(0), "max_pending_tasks"),
            (EngineConfig::default().with_max_pending(2), "max_pending_tasks"),
            (
                EngineConfig::default().with_step_coupling(StepCoupling {
                    salience: 1.2,
                    ..StepCoupling::default()
                }),
                "step_coupling.salience",
            ),
            (EngineConfig::default().with_cycle_duration(0.0), "cycle_duration"),
            (EngineConfig::default().with_cycle_duration(1e20), "cycle_duration"),
            (EngineConfig::default().with_cycle_duration(f64::INFINITY), "cycle_duration"),
            (
                EngineConfig::default().map_reservoirs(|r| r.with_leak_rate(0.0)),
                "leak_rate",
            ),
            (
                EngineConfig::default().with_streams(vec![
                    StreamConfig::new(StreamKind::Pivotal),
                    StreamConfig::new(StreamKind::Pivotal),
                ]),
                "duplicate",
            ),
            (
                EngineConfig::default()
                    .with_streams(vec![StreamConfig::new(StreamKind::Salience).with_phase_offset(12)]),
                "phase offset",
            ),
        ];
        for (cfg, needle) in cases {
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains(needle), "{err} should mention {needle}");
        }
    }

    #[test]
    fn step_coupling_overrides_uniform_strength() {
        let uniform = EngineConfig::default().with_coupling(0.2);
        assert_eq!(uniform.coupling_for(StepType::Pivotal), 0.2);
        assert_eq!(uniform.coupling_for(StepType::Salience), 0.2);

        let typed = uniform.with_step_coupling(StepCoupling::default());
        typed.validate().unwrap();
        assert_eq!(typed.coupling_for(StepType::Pivotal), 0.5);
        assert_eq!(typed.coupling_for(StepType::Affordance), 0.3);
        assert_eq!(typed.coupling_for(StepType::Salience), 0.4);
    }

    #[test]
    fn huge_cycle_duration_is_rejected_not_panicking() {
        let cfg = EngineConfig::default().with_cycle_duration(1e20);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "cycle_duration_secs",
                ..
            })
        ));
        assert_eq!(cfg.cycle_duration(), Duration::MAX);
        assert!(cfg.barrier_timeout() > Duration::from_secs(1));
    }

    #[test]
    fn explicit_barrier_timeout_wins() {
        let cfg = EngineConfig::default().with_barrier_timeout(Duration::from_millis(250));
        assert_eq!(cfg.barrier_timeout(), Duration::from_millis(250));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_round_trip_and_partial_files() {
        let cfg = EngineConfig::default().with_coupling(0.6).with_seed(9);
        let back = EngineConfig::from_json_str(&cfg.to_json_pretty()).unwrap();
        assert_eq!(back, cfg);

        let partial = EngineConfig::from_json_str(r#"{ "coupling_strength": 0.4 }"#).unwrap();
        assert_eq!(partial.coupling_strength, 0.4);
        assert_eq!(partial.streams.len(), 3);

        let invalid = EngineConfig::from_json_str(r#"{ "coupling_strength": 4.0 }"#);
        assert!(matches!(invalid, Err(ConfigError::OutOfRange { .. })));
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
