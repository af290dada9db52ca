//! The cycle driver.
//!
//! One call to [`CognitiveEngine::tick`] queues one reservoir task per stream
//! for the next step and only then advances the clock. The step's tasks are
//! queued held and released together, so a step that cannot be queued leaves
//! no trace and is retried by the next tick. Each task is chained behind the
//! previous task for the same stream, so a stream is only ever touched by one
//! worker at a time. At a rendezvous step the driver blocks on the triad
//! latch, couples whatever arrived, scores coherence through barrier-held
//! auxiliary tasks and publishes `TriadicSync`. The clock never advances past
//! a rendezvous before it has resolved or timed out.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::barrier::{Rendezvous, SyncBarrier, SyncBarrierCoordinator};
use crate::clock::{step_config, CycleClock, StepChange, StepConfig, StepType, StreamKind};
use crate::coherence::{pairs, pairwise_coherence, CoherenceComputer, CoherenceMatrix};
use crate::config::{check_step_capacity, EngineConfig};
use crate::error::{CapacityError, EchoError, Result, TaskError, TimeoutError};
use crate::events::{EngineEvent, EventBus, Subscription};
use crate::executor::{
    BarrierType, ExecutorConfig, ExecutorMetrics, TaskContext, TaskDescriptor, TaskDomain,
    TaskGraphExecutor, TaskHandle, TaskPriority,
};
use crate::stream::{StreamId, StreamSlot, StreamState, StreamSummary};

const PIVOTAL_RELEVANCE_BOOST: f64 = 1.2;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineMetrics {
    pub steps: u64,
    pub cycles: u64,
    pub syncs: u64,
    pub partial_syncs: u64,
    /// Steps whose end-of-step wait ran into the barrier timeout.
    pub step_timeouts: u64,
    pub backpressure_stalls: u64,
    pub dropped_aux_tasks: u64,
    pub dropped_events: u64,
    pub inputs: u64,
    pub last_sync_quality: f64,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub change: StepChange,
    pub config: StepConfig,
    pub primary: StreamId,
    pub handles: Vec<TaskHandle>,
    pub sync: Option<SyncBarrier>,
    /// Backpressure forced the driver to stall this step.
    pub stalled: bool,
}

pub struct EngineBuilder {
    cfg: EngineConfig,
    executor: Option<Arc<TaskGraphExecutor>>,
    events: Arc<EventBus<EngineEvent>>,
}

impl EngineBuilder {
    pub fn new(cfg: EngineConfig) -> Self {
        let events = Arc::new(EventBus::with_capacity(cfg.event_capacity));
        Self {
            cfg,
            executor: None,
            events,
        }
    }

    /// Run on an existing pool instead of starting a new one.
    pub fn with_executor(mut self, executor: Arc<TaskGraphExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Register a subscriber before the first step so nothing is missed.
    pub fn subscribe(&self, capacity: usize) -> Subscription<EngineEvent> {
        self.events.subscribe(capacity)
    }

    /// Subscriber bounded by the configured `event_capacity`.
    pub fn subscribe_default(&self) -> Subscription<EngineEvent> {
        self.events.subscribe_default()
    }

    pub fn build(self) -> Result<CognitiveEngine> {
        let cfg = self.cfg;
        cfg.validate()?;

        let slots = cfg
            .streams
            .iter()
            .enumerate()
            .map(|(id, s)| StreamState::new(id, s).map(StreamSlot::new))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(TaskGraphExecutor::new(ExecutorConfig::from_engine(&cfg))?),
        };
        check_step_capacity(executor.config().max_pending_tasks, slots.len())?;

        let clock = CycleClock::new(cfg.cycle_duration())
            .with_policy(cfg.sync_policy)
            .with_subdivision(cfg.subdivision);

        info!(
            streams = slots.len(),
            workers = executor.worker_count(),
            policy = ?cfg.sync_policy,
            "cognitive engine ready"
        );

        Ok(CognitiveEngine {
            kinds: cfg.streams.iter().map(|s| s.kind).collect(),
            names: cfg.streams.iter().map(|s| s.name.clone()).collect(),
            last_task: vec![None; slots.len()],
            coordinator: SyncBarrierCoordinator::from_config(&cfg),
            clock,
            slots,
            executor,
            events: self.events,
            metrics: EngineMetrics {
                last_sync_quality: 1.0,
                ..EngineMetrics::default()
            },
            last_sync: None,
            cancelled: false,
            cfg,
        })
    }
}

pub struct CognitiveEngine {
    cfg: EngineConfig,
    clock: CycleClock,
    slots: Vec<StreamSlot>,
    kinds: Vec<StreamKind>,
    names: Vec<String>,
    executor: Arc<TaskGraphExecutor>,
    coordinator: SyncBarrierCoordinator,
    events: Arc<EventBus<EngineEvent>>,
    /// Most recent task per stream; the next one for that stream waits on it.
    last_task: Vec<Option<TaskHandle>>,
    metrics: EngineMetrics,
    last_sync: Option<SyncBarrier>,
    cancelled: bool,
}

impl CognitiveEngine {
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        EngineBuilder::new(cfg).build()
    }

    pub fn builder(cfg: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(cfg)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn clock(&self) -> &CycleClock {
        &self.clock
    }

    pub fn step(&self) -> u8 {
        self.clock.step()
    }

    pub fn cycle_count(&self) -> u64 {
        self.clock.cycle_count()
    }

    pub fn executor(&self) -> &TaskGraphExecutor {
        &self.executor
    }

    pub fn stream_count(&self) -> usize {
        self.slots.len()
    }

    pub fn stream_name(&self, id: StreamId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn stream_id(&self, name: &str) -> Option<StreamId> {
        self.names.iter().position(|n| n == name)
    }

    pub fn last_sync(&self) -> Option<&SyncBarrier> {
        self.last_sync.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription<EngineEvent> {
        self.events.subscribe(capacity)
    }

    /// Subscriber bounded by the configured `event_capacity`.
    pub fn subscribe_default(&self) -> Subscription<EngineEvent> {
        self.events.subscribe_default()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancelled {
            Err(EchoError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Stream named primary by the step table; falls back to the triadic
    /// group when no stream of that kind is configured.
    fn primary_stream(&self, cfg: &StepConfig) -> StreamId {
        self.kinds
            .iter()
            .position(|&k| k == cfg.primary)
            .unwrap_or(cfg.triadic_group as usize % self.slots.len())
    }

    /// Run the next step. On `CapacityError` the clock stays put and the
    /// same step is attempted again by the next call.
    pub fn tick(&mut self) -> Result<StepReport> {
        self.ensure_live()?;
        let mut next = self.clock.clone();
        let change = next.advance();
        self.run_step(next, change)
    }

    /// Advance the micro-clock; runs a step only when a step boundary is crossed.
    pub fn tick_micro(&mut self) -> Result<Option<StepReport>> {
        self.ensure_live()?;
        let mut next = self.clock.clone();
        match next.tick_micro() {
            Some(change) => self.run_step(next, change).map(Some),
            None => {
                self.clock = next;
                Ok(None)
            }
        }
    }

    /// Position on a co-clock with `period` steps per cycle, when aligned.
    pub fn aligned_position(&self, period: u32) -> Option<u32> {
        self.clock.aligned_position(period)
    }

    /// Simulated steps: no sleeping between them.
    pub fn run_steps(&mut self, steps: usize) -> Result<Vec<StepReport>> {
        (0..steps).map(|_| self.tick()).collect()
    }

    /// Steps paced to the wall clock, one per `cycle_duration / 12`.
    pub fn run_paced(&mut self, steps: usize) -> Result<Vec<StepReport>> {
        let interval = self.clock.step_interval();
        let start = Instant::now();
        let mut reports = Vec::with_capacity(steps);
        for k in 1..=steps {
            reports.push(self.tick()?);
            let deadline = interval.checked_mul(k as u32).and_then(|d| start.checked_add(d));
            if let Some(wait) = deadline.map(|d| d.saturating_duration_since(Instant::now())) {
                thread::sleep(wait);
            }
        }
        Ok(reports)
    }

    fn run_step(&mut self, next: CycleClock, change: StepChange) -> Result<StepReport> {
        let step = change.new;
        let step_cfg = *next.config();
        let primary = self.primary_stream(&step_cfg);
        let triad = next.triad_index();
        let latch = triad.map(|_| self.coordinator.open((0..self.slots.len()).collect()));

        let stalled = self.reserve(self.slots.len())?;
        let chained = self.last_task.clone();
        let mut handles = Vec::with_capacity(self.slots.len());
        for id in 0..self.slots.len() {
            let priority = if id == primary {
                TaskPriority::Critical
            } else {
                TaskPriority::High
            };
            let desc = TaskDescriptor::new(format!("{} step {step}", self.names[id]))
                .with_domain(TaskDomain::ReservoirCompute)
                .with_priority(priority)
                .with_estimate(next.step_interval() / 4)
                .with_barrier(BarrierType::StreamSync);
            let desc = match self.last_task[id] {
                Some(prev) => desc.after(prev),
                None => desc,
            };
            let work = stream_update(
                self.slots[id].clone(),
                Arc::clone(&self.events),
                latch.clone(),
                step,
                id == primary,
            );
            match self.executor.submit(desc, work) {
                Ok(handle) => {
                    self.last_task[id] = Some(handle);
                    handles.push(handle);
                }
                Err(err) => {
                    // Nothing has run yet: drop the held tasks and keep the clock.
                    for &handle in &handles {
                        self.executor.cancel(handle);
                    }
                    self.last_task = chained;
                    warn!(step, %err, "step could not be queued, clock held");
                    return Err(err);
                }
            }
        }

        self.clock = next;
        self.events.publish(EngineEvent::StepChanged {
            old: change.old,
            new: change.new,
            cycle: change.cycle,
        });
        if change.wrapped {
            self.events.publish(EngineEvent::CycleCompleted { cycle: change.cycle });
        }
        let old_mode = step_config(change.old).mode;
        if old_mode != step_cfg.mode {
            self.events.publish(EngineEvent::ModeChanged {
                old: old_mode,
                new: step_cfg.mode,
                step,
            });
        }

        let graph_name = format!("step {step} cycle {}", change.cycle);
        self.executor.profiler().graph_submitted(&graph_name);
        debug!(step, cycle = change.cycle, primary, sync = triad.is_some(), "step");

        // One bound for the whole step: rendezvous, pair scoring and settling.
        let deadline = Instant::now().checked_add(self.cfg.barrier_timeout());
        let sync = match (triad, latch) {
            (Some(triad_index), Some(latch)) => Some(self.rendezvous(
                triad_index,
                step,
                step_cfg.step_type,
                &latch,
                &handles,
                deadline,
            )),
            _ => {
                self.executor.release_tasks(&handles);
                None
            }
        };

        if sync.is_some() || !self.cfg.pipeline_non_sync_steps {
            if let Err(TimeoutError { waited, outstanding, .. }) = self.executor.wait_all(remaining(deadline)) {
                self.metrics.step_timeouts += 1;
                warn!(step, outstanding, waited_ms = waited.as_millis() as u64, "step did not settle in time");
            }
        }
        self.executor.profiler().graph_completed(&graph_name);

        self.metrics.steps += 1;
        self.metrics.cycles = self.clock.cycle_count();
        self.metrics.dropped_events = self.events.dropped();
        if let Some(barrier) = &sync {
            self.last_sync = Some(barrier.clone());
        }

        Ok(StepReport {
            change,
            config: step_cfg,
            primary,
            handles,
            sync,
            stalled,
        })
    }

    /// Make room for `needed` more tasks, stalling once on a saturated
    /// executor. Returns whether it stalled.
    fn reserve(&mut self, needed: usize) -> Result<bool> {
        let max = self.executor.config().max_pending_tasks;
        let pending = self.executor.pending_count();
        if pending + needed <= max {
            return Ok(false);
        }
        self.metrics.backpressure_stalls += 1;
        warn!(pending, max, "executor saturated, stalling step advance");
        if let Err(timeout) = self.executor.wait_all(self.cfg.barrier_timeout()) {
            debug!(outstanding = timeout.outstanding, "stall ended with work still queued");
        }
        let pending = self.executor.pending_count();
        if pending + needed <= max {
            Ok(true)
        } else {
            Err(EchoError::Capacity(CapacityError { pending, max }))
        }
    }

    /// Submit a task behind the stream's previous one. Input work is never
    /// dropped: on backpressure the driver stalls once and retries.
    fn submit_chained<F, W>(&mut self, id: StreamId, desc: TaskDescriptor, make: F) -> Result<TaskHandle>
    where
        F: Fn() -> W,
        W: FnOnce(&TaskContext) -> std::result::Result<(), TaskError> + Send + 'static,
    {
        let desc = match self.last_task[id] {
            Some(prev) => desc.after(prev),
            None => desc,
        };
        let handle = match self.executor.submit(desc.clone(), make()) {
            Ok(handle) => handle,
            Err(EchoError::Capacity(_)) => {
                self.reserve(1)?;
                self.executor.submit(desc, make())?
            }
            Err(err) => return Err(err),
        };
        self.last_task[id] = Some(handle);
        Ok(handle)
    }

    fn rendezvous(
        &mut self,
        triad_index: u8,
        step: u8,
        step_type: StepType,
        latch: &Rendezvous,
        stream_tasks: &[TaskHandle],
        deadline: Option<Instant>,
    ) -> SyncBarrier {
        // Pair scorers are queued while the stream tasks are still held, and
        // stay held themselves until the sync point is released.
        let n = self.slots.len();
        let all_pairs = pairs(n);
        let board: Arc<Mutex<Vec<Option<Arc<[f64]>>>>> = Arc::new(Mutex::new(vec![None; n]));
        let results: Arc<Mutex<Vec<Option<f64>>>> = Arc::new(Mutex::new(vec![None; all_pairs.len()]));

        let mut pair_tasks = Vec::with_capacity(all_pairs.len());
        for (k, &(i, j)) in all_pairs.iter().enumerate() {
            let desc = TaskDescriptor::new(format!("coherence {i}-{j} step {step}"))
                .with_domain(TaskDomain::Coherence)
                .with_priority(TaskPriority::Normal)
                .with_barrier(BarrierType::TriadicSync)
                .after_all([stream_tasks[i], stream_tasks[j]]);
            let (board, results) = (Arc::clone(&board), Arc::clone(&results));
            let submitted = self.executor.submit(desc, move |_| {
                let (a, b) = {
                    let board = board.lock();
                    (board[i].clone(), board[j].clone())
                };
                if let (Some(a), Some(b)) = (a, b) {
                    results.lock()[k] = Some(pairwise_coherence(&a, &b));
                }
                Ok(())
            });
            match submitted {
                Ok(handle) => pair_tasks.push(handle),
                Err(err) => {
                    self.metrics.dropped_aux_tasks += 1;
                    debug!(%err, "coherence task dropped, scoring inline");
                }
            }
        }

        self.executor.release_tasks(stream_tasks);

        let outcome = self.coordinator.await_within(latch, remaining(deadline));
        let states = self.coordinator.couple_slots(&self.slots, &outcome.arrived, step_type);
        {
            let mut board = board.lock();
            for (&id, state) in outcome.arrived.iter().zip(&states) {
                board[id] = Some(Arc::clone(state));
            }
        }

        self.executor.release_barrier(BarrierType::TriadicSync);
        if let Err(timeout) = self.executor.wait_for(&pair_tasks, remaining(deadline)) {
            warn!(outstanding = timeout.outstanding, "coherence tasks late, scoring inline");
        }

        let mut matrix = CoherenceMatrix::identity(outcome.arrived.len());
        {
            let results = results.lock();
            for a in 0..outcome.arrived.len() {
                for b in (a + 1)..outcome.arrived.len() {
                    let (i, j) = (outcome.arrived[a], outcome.arrived[b]);
                    let scored = all_pairs
                        .iter()
                        .position(|&p| p == (i, j))
                        .and_then(|k| results[k]);
                    let value = scored.unwrap_or_else(|| pairwise_coherence(&states[a], &states[b]));
                    matrix.set(a, b, value);
                }
            }
        }

        self.coordinator.apply_coherence(&self.slots, &outcome.arrived, &matrix);
        let barrier = self.coordinator.conclude(triad_index, step, &outcome, &matrix);

        self.metrics.syncs += 1;
        if barrier.partial {
            self.metrics.partial_syncs += 1;
        }
        self.metrics.last_sync_quality = barrier.sync_quality;
        self.events.publish(EngineEvent::TriadicSync {
            triad_index,
            step,
            quality: barrier.sync_quality,
            partial: barrier.partial,
            participants: barrier.participants.clone(),
        });
        barrier
    }

    /// Feed a sensory vector. Without a hint it goes to the current step's
    /// primary stream. The vector becomes that stream's held drive and an
    /// update is queued immediately.
    pub fn process_input(&mut self, stream_hint: Option<StreamId>, input: Vec<f64>) -> Result<TaskHandle> {
        self.ensure_live()?;
        let step_cfg = *self.clock.config();
        let id = match stream_hint {
            Some(id) if id < self.slots.len() => id,
            Some(id) => return Err(EchoError::UnknownStream(id)),
            None => self.primary_stream(&step_cfg),
        };

        let magnitude = if input.is_empty() {
            0.0
        } else {
            input.iter().map(|x| x.abs()).sum::<f64>() / input.len() as f64
        };
        let boost = if step_cfg.step_type == StepType::Pivotal {
            PIVOTAL_RELEVANCE_BOOST
        } else {
            1.0
        };
        let relevance = (magnitude * self.metrics.last_sync_quality * boost).clamp(0.0, 1.0);

        let desc = TaskDescriptor::new(format!("{} input", self.names[id]))
            .with_domain(TaskDomain::SensoryIntegration)
            .with_priority(TaskPriority::Critical);
        let slot = self.slots[id].clone();
        let events = Arc::clone(&self.events);
        let step = step_cfg.step;
        let input: Arc<[f64]> = input.into();
        let handle = self.submit_chained(id, desc, || {
            let (slot, events, input) = (slot.clone(), Arc::clone(&events), Arc::clone(&input));
            move |_: &TaskContext| -> std::result::Result<(), TaskError> {
                let (level, snapshot) = {
                    let mut stream = slot.lease()?;
                    stream.set_drive(input.to_vec());
                    stream.relevance = relevance;
                    let level = stream.step();
                    (level, Arc::<[f64]>::from(stream.state()))
                };
                events.publish(EngineEvent::StreamUpdated {
                    stream_id: slot.id(),
                    step,
                    activation_level: level,
                    state_snapshot: snapshot,
                });
                Ok(())
            }
        })?;
        self.metrics.inputs += 1;

        if step_cfg.step_type == StepType::Pivotal && relevance >= self.cfg.relevance_threshold {
            self.events.publish(EngineEvent::RelevanceRealized { step, relevance });
        }
        Ok(handle)
    }

    /// Wait for all queued work.
    pub fn settle(&self, timeout: Duration) -> std::result::Result<(), TimeoutError> {
        self.executor.wait_all(timeout)
    }

    fn settled_states(&self) -> Vec<Arc<[f64]>> {
        if let Err(err) = self.settle(self.cfg.barrier_timeout()) {
            debug!(%err, "reading stream states with work still in flight");
        }
        self.slots.iter().map(|s| Arc::from(s.lock().state())).collect()
    }

    pub fn aggregate_coherence(&self) -> f64 {
        CoherenceComputer.aggregate(&self.settled_states())
    }

    pub fn coherence_matrix(&self) -> CoherenceMatrix {
        CoherenceComputer.matrix(&self.settled_states())
    }

    pub fn stream_snapshots(&self) -> Vec<StreamSummary> {
        if let Err(err) = self.settle(self.cfg.barrier_timeout()) {
            debug!(%err, "snapshot with work still in flight");
        }
        let step = self.clock.step();
        self.slots.iter().map(|s| s.lock().summary(step)).collect()
    }

    pub fn stream_state(&self, id: StreamId) -> Result<Vec<f64>> {
        let slot = self.slots.get(id).ok_or(EchoError::UnknownStream(id))?;
        if let Err(err) = self.settle(self.cfg.barrier_timeout()) {
            debug!(%err, "state read with work still in flight");
        }
        Ok(slot.lock().state().to_vec())
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            dropped_events: self.events.dropped(),
            ..self.metrics
        }
    }

    pub fn executor_metrics(&self) -> ExecutorMetrics {
        self.executor.metrics()
    }

    /// Write the profiler ring as a Chrome trace once queued work settles.
    pub fn export_trace(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Err(err) = self.settle(self.cfg.barrier_timeout()) {
            debug!(%err, "exporting trace with work still in flight");
        }
        let io_err = |e: std::io::Error| EchoError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let file = File::create(path).map_err(io_err)?;
        let mut out = BufWriter::new(file);
        self.executor.profiler().export_chrome_trace(&mut out).map_err(io_err)?;
        out.flush().map_err(io_err)?;
        info!(path = %path.display(), "trace exported");
        Ok(())
    }

    /// Restart from step 1 with the initial reservoir states.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.settle(self.cfg.barrier_timeout())?;
        self.clock.reset();
        for slot in &self.slots {
            slot.lock().reset();
        }
        self.last_task.iter_mut().for_each(|t| *t = None);
        self.last_sync = None;
        self.metrics = EngineMetrics {
            last_sync_quality: 1.0,
            ..EngineMetrics::default()
        };
        info!("engine reset");
        Ok(())
    }

    /// Terminal. Drains queued work, lets in-flight tasks finish.
    pub fn cancel(&mut self) -> usize {
        if self.cancelled {
            return 0;
        }
        self.cancelled = true;
        self.executor.cancel_run()
    }
}

fn remaining(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
}

fn stream_update(
    slot: StreamSlot,
    events: Arc<EventBus<EngineEvent>>,
    latch: Option<Arc<Rendezvous>>,
    step: u8,
    primary: bool,
) -> impl FnOnce(&TaskContext) -> std::result::Result<(), TaskError> + Send + 'static {
    move |_: &TaskContext| -> std::result::Result<(), TaskError> {
        let (level, snapshot) = {
            let mut stream = slot.lease()?;
            stream.focus(primary);
            let level = stream.step();
            (level, Arc::<[f64]>::from(stream.state()))
        };
        events.publish(EngineEvent::StreamUpdated {
            stream_id: slot.id(),
            step,
            activation_level: level,
            state_snapshot: snapshot,
        });
        // Arrive only after the lease is released so the driver can couple.
        if let Some(latch) = latch {
            latch.arrive(slot.id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{CognitiveMode, SyncPolicy};
    use crate::error::CapacityError;
    use crate::reservoir::ReservoirConfig;

    fn small(policy: SyncPolicy) -> EngineConfig {
        EngineConfig::default()
            .with_workers(2)
            .with_sync_policy(policy)
            .map_reservoirs(|r: ReservoirConfig| r.with_units(24))
    }

    #[test]
    fn primary_stream_follows_table() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        let primaries: Vec<StreamId> = engine
            .run_steps(12)
            .unwrap()
            .iter()
            .map(|r| r.primary)
            .collect();
        // Steps 2..=12 then 1.
        assert_eq!(primaries, vec![1, 2, 0, 0, 1, 2, 0, 0, 1, 2, 0, 0]);
    }

    #[test]
    fn sync_steps_produce_barriers() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        let events = engine.subscribe(512);
        let reports = engine.run_steps(12).unwrap();
        let synced: Vec<u8> = reports
            .iter()
            .filter(|r| r.sync.is_some())
            .map(|r| r.change.new)
            .collect();
        assert_eq!(synced, vec![5, 9, 1]);

        let updates = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::StreamUpdated { .. }))
            .count();
        assert_eq!(updates, 36);
        assert_eq!(engine.metrics().syncs, 3);
        assert_eq!(engine.cycle_count(), 1);
    }

    #[test]
    fn input_goes_to_hinted_or_primary_stream() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        let events = engine.subscribe(64);
        engine.process_input(Some(2), vec![0.5; 24]).unwrap();
        engine.process_input(None, vec![0.25; 24]).unwrap();
        engine.settle(Duration::from_secs(5)).unwrap();

        let mut targets: Vec<StreamId> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::StreamUpdated { stream_id, .. } => Some(stream_id),
                _ => None,
            })
            .collect();
        // Step 1 is pivotal, so the default target is stream 0.
        targets.sort_unstable();
        assert_eq!(targets, vec![0, 2]);
        assert_eq!(
            engine.process_input(Some(9), vec![1.0]).unwrap_err(),
            EchoError::UnknownStream(9)
        );
    }

    #[test]
    fn strong_pivotal_input_is_realized() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        let events = engine.subscribe(64);
        engine.process_input(None, vec![0.9; 8]).unwrap();
        engine.settle(Duration::from_secs(5)).unwrap();
        let realized: Vec<f64> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::RelevanceRealized { relevance, .. } => Some(relevance),
                _ => None,
            })
            .collect();
        assert_eq!(realized.len(), 1);
        assert!((realized[0] - 1.0).abs() < 1e-12);
        assert!((engine.stream_snapshots()[0].relevance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn saturated_executor_holds_the_step() {
        let executor = Arc::new(
            TaskGraphExecutor::new(ExecutorConfig::default().with_workers(2).with_max_pending(3)).unwrap(),
        );
        let cfg = small(SyncPolicy::GroupStart).with_barrier_timeout(Duration::from_millis(50));
        let builder = CognitiveEngine::builder(cfg).with_executor(Arc::clone(&executor));
        let events = builder.subscribe(512);
        let mut engine = builder.build().unwrap();
        engine.run_steps(3).unwrap();
        assert_eq!(engine.step(), 4);
        events.drain();

        for i in 0..3 {
            executor
                .submit(
                    TaskDescriptor::new(format!("blocker{i}")).with_barrier(BarrierType::StageSync),
                    |_| Ok(()),
                )
                .unwrap();
        }
        let err = engine.tick().unwrap_err();
        assert_eq!(err, EchoError::Capacity(CapacityError { pending: 3, max: 3 }));
        assert_eq!(engine.step(), 4);
        assert_eq!(engine.metrics().steps, 3);
        assert_eq!(engine.metrics().backpressure_stalls, 1);
        assert!(events.drain().is_empty(), "a held step publishes nothing");

        executor.release_barrier(BarrierType::StageSync);
        executor.wait_all(Duration::from_secs(5)).unwrap();

        // The same step runs once there is room, rendezvous included.
        let report = engine.tick().unwrap();
        assert_eq!(report.change.new, 5);
        assert_eq!(report.sync.as_ref().map(|b| b.step), Some(5));
        for s in engine.stream_snapshots() {
            assert_eq!(s.updates, 4);
        }
        let syncs: Vec<u8> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::TriadicSync { step, .. } => Some(step),
                _ => None,
            })
            .collect();
        assert_eq!(syncs, vec![5]);

        // Three stream tasks fill the pool, so coherence is scored inline.
        engine.run_steps(8).unwrap();
        let m = engine.metrics();
        assert_eq!((m.steps, m.syncs), (12, 3));
        assert!(m.dropped_aux_tasks >= 9);
        assert_eq!(engine.cycle_count(), 1);
    }

    #[test]
    fn injected_executor_must_fit_a_step() {
        let executor =
            Arc::new(TaskGraphExecutor::new(ExecutorConfig::default().with_workers(1).with_max_pending(2)).unwrap());
        let built = CognitiveEngine::builder(small(SyncPolicy::GroupStart))
            .with_executor(executor)
            .build();
        assert!(matches!(
            built,
            Err(EchoError::Config(crate::error::ConfigError::OutOfRange {
                field: "max_pending_tasks",
                ..
            }))
        ));
    }

    #[test]
    fn mode_flips_are_published() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        let events = engine.subscribe(512);
        engine.run_steps(12).unwrap();
        let flips: Vec<(CognitiveMode, u8)> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::ModeChanged { new, step, .. } => Some((new, step)),
                _ => None,
            })
            .collect();
        assert_eq!(
            flips,
            vec![
                (CognitiveMode::Reflective, 6),
                (CognitiveMode::Expressive, 8),
                (CognitiveMode::Reflective, 10),
                (CognitiveMode::Expressive, 1),
            ]
        );
    }

    #[test]
    fn default_subscription_is_bounded_by_config() {
        let builder = CognitiveEngine::builder(small(SyncPolicy::GroupStart).with_event_capacity(4));
        let bounded = builder.subscribe_default();
        let roomy = builder.subscribe(256);
        let mut engine = builder.build().unwrap();
        engine.run_steps(2).unwrap();

        // Each step publishes StepChanged plus one StreamUpdated per stream.
        assert_eq!(bounded.len(), 4);
        assert_eq!(roomy.len(), 8);
        assert_eq!(engine.metrics().dropped_events, 4);
    }

    #[test]
    fn oversized_cycle_duration_is_a_config_error() {
        let cfg = small(SyncPolicy::GroupStart).with_cycle_duration(1e20);
        assert!(matches!(
            CognitiveEngine::new(cfg),
            Err(EchoError::Config(crate::error::ConfigError::OutOfRange {
                field: "cycle_duration_secs",
                ..
            }))
        ));
    }

    #[test]
    fn cancel_is_terminal() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        engine.run_steps(3).unwrap();
        engine.cancel();
        assert!(engine.is_cancelled());
        assert_eq!(engine.tick().unwrap_err(), EchoError::Cancelled);
        assert_eq!(engine.process_input(None, vec![0.1]).unwrap_err(), EchoError::Cancelled);
        assert_eq!(engine.reset().unwrap_err(), EchoError::Cancelled);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        let initial = engine.stream_state(1).unwrap();
        engine.process_input(Some(1), vec![0.7; 24]).unwrap();
        engine.run_steps(7).unwrap();
        assert_ne!(engine.stream_state(1).unwrap(), initial);
        engine.reset().unwrap();
        assert_eq!(engine.stream_state(1).unwrap(), initial);
        assert_eq!((engine.step(), engine.cycle_count()), (1, 0));
        assert_eq!(engine.metrics().steps, 0);
    }

    #[test]
    fn micro_ticks_run_a_step_per_boundary() {
        let cfg = small(SyncPolicy::GroupStart).with_subdivision(5);
        let mut engine = CognitiveEngine::new(cfg).unwrap();
        let mut steps = 0;
        for _ in 0..60 {
            if engine.tick_micro().unwrap().is_some() {
                steps += 1;
            }
        }
        assert_eq!(steps, 12);
        assert_eq!(engine.cycle_count(), 1);
        assert_eq!(engine.aligned_position(30), Some(1));
    }

    #[test]
    fn builder_subscription_sees_first_step() {
        let builder = CognitiveEngine::builder(small(SyncPolicy::GroupStart));
        let events = builder.subscribe(16);
        let mut engine = builder.build().unwrap();
        engine.tick().unwrap();
        assert_eq!(
            events.try_recv(),
            Some(EngineEvent::StepChanged {
                old: 1,
                new: 2,
                cycle: 0
            })
        );
    }

    #[test]
    fn trace_export_is_chrome_json() {
        let mut engine = CognitiveEngine::new(small(SyncPolicy::GroupStart)).unwrap();
        engine.run_steps(4).unwrap();
        let path = std::env::temp_dir().join(format!("echobeats-trace-{}.json", std::process::id()));
        engine.export_trace(&path).unwrap();

        let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).ok();
        let events = doc["traceEvents"].as_array().unwrap();
        let complete = events.iter().filter(|e| e["ph"] == "X").count();
        assert!(complete >= 12, "one complete event per stream task, got {complete}");
    }

    #[test]
    fn invalid_config_refuses_to_start() {
        let cfg = EngineConfig::default().with_streams(Vec::new());
        assert!(matches!(
            CognitiveEngine::new(cfg),
            Err(EchoError::Config(crate::error::ConfigError::NoStreams))
        ));
    }
}
