//! Dependency-aware task graph executed on a fixed worker pool.
//!
//! Ready tasks enter one of two shared injectors (urgent for Critical/High,
//! normal otherwise). Each worker owns a LIFO deque: it pops its own work
//! first, then pulls batches from the injectors, then steals FIFO from its
//! peers. Dependents made ready by a finishing task go onto the finishing
//! worker's deque.
//!
//! Per-task lifecycle: `Pending -> Scheduled -> Running -> {Completed | Failed | Cancelled}`.
//! A dependency resolves when its prerequisite reaches any terminal state, so
//! a failed task never wedges its siblings or dependents.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{default_worker_count, EngineConfig};
use crate::error::{CapacityError, EchoError, TaskError, TimeoutError};
use crate::events::{EventBus, Subscription};
use crate::profiler::Profiler;

pub type TaskId = u64;

/// Opaque handle returned by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TaskHandle(TaskId);

impl TaskHandle {
    pub fn id(self) -> TaskId {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Deferred,
}

impl TaskPriority {
    pub fn is_urgent(self) -> bool {
        matches!(self, TaskPriority::Critical | TaskPriority::High)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TaskDomain {
    ReservoirCompute,
    SensoryIntegration,
    Coherence,
    Coupling,
    Telemetry,
    #[default]
    Custom,
}

impl TaskDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReservoirCompute => "reservoir_compute",
            Self::SensoryIntegration => "sensory_integration",
            Self::Coherence => "coherence",
            Self::Coupling => "coupling",
            Self::Telemetry => "telemetry",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Rendezvous a task can be held for until the driver releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BarrierType {
    StreamSync,
    TriadicSync,
    StageSync,
    CycleSync,
}

impl BarrierType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamSync => "StreamSync",
            Self::TriadicSync => "TriadicSync",
            Self::StageSync => "StageSync",
            Self::CycleSync => "CycleSync",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskDescriptor {
    pub name: String,
    pub domain: TaskDomain,
    pub priority: TaskPriority,
    pub dependencies: Vec<TaskHandle>,
    pub required_barrier: Option<BarrierType>,
    pub estimated: Option<Duration>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_domain(mut self, domain: TaskDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn after(mut self, handle: TaskHandle) -> Self {
        self.dependencies.push(handle);
        self
    }

    pub fn after_all(mut self, handles: impl IntoIterator<Item = TaskHandle>) -> Self {
        self.dependencies.extend(handles);
        self
    }

    pub fn with_barrier(mut self, barrier: BarrierType) -> Self {
        self.required_barrier = Some(barrier);
        self
    }

    pub fn with_estimate(mut self, estimated: Duration) -> Self {
        self.estimated = Some(estimated);
        self
    }
}

/// What a running task can see about itself.
pub struct TaskContext {
    handle: TaskHandle,
    worker: usize,
    run_cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// True once the whole run has been cancelled. Long tasks may bail early.
    pub fn is_cancelled(&self) -> bool {
        self.run_cancelled.load(Ordering::Acquire)
    }
}

/// Finished-task entry kept in the completed map.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub handle: TaskHandle,
    pub name: String,
    pub domain: TaskDomain,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub worker: Option<usize>,
    pub estimated: Option<Duration>,
    /// Submission until start (or until cancellation).
    pub queued: Duration,
    /// Run time; `None` for tasks that never started.
    pub actual: Option<Duration>,
    pub error: Option<TaskError>,
}

/// Delivered on the completion channel for every task that reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub handle: TaskHandle,
    pub name: String,
    pub domain: TaskDomain,
    pub status: TaskStatus,
    pub worker: Option<usize>,
    pub duration: Duration,
    pub error: Option<TaskError>,
}

impl From<&TaskRecord> for TaskCompletion {
    fn from(r: &TaskRecord) -> Self {
        Self {
            handle: r.handle,
            name: r.name.clone(),
            domain: r.domain,
            status: r.status,
            worker: r.worker,
            duration: r.actual.unwrap_or_default(),
            error: r.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExecutorMetrics {
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub steals: u64,
    pub running: usize,
    pub pending: usize,
    pub barriers_released: u64,
    pub avg_latency_us: f64,
    pub peak_latency_us: u64,
    pub utilization: f64,
    /// Rejected submissions over all submission attempts.
    pub saturation: f64,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub max_pending_tasks: usize,
    pub completed_retention: usize,
    pub profiling: bool,
    /// Ring size of the profiler's event buffer.
    pub profile_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            max_pending_tasks: 256,
            completed_retention: 1024,
            profiling: true,
            profile_capacity: 16_384,
        }
    }
}

impl ExecutorConfig {
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self {
            workers: cfg.worker_count,
            max_pending_tasks: cfg.max_pending_tasks,
            completed_retention: cfg.completed_retention,
            profiling: cfg.profiling,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_pending(mut self, max_pending_tasks: usize) -> Self {
        self.max_pending_tasks = max_pending_tasks;
        self
    }

    pub fn with_retention(mut self, completed_retention: usize) -> Self {
        self.completed_retention = completed_retention;
        self
    }
}

type Work = Box<dyn FnOnce(&TaskContext) -> Result<(), TaskError> + Send + 'static>;

struct Node {
    name: String,
    domain: TaskDomain,
    priority: TaskPriority,
    estimated: Option<Duration>,
    status: TaskStatus,
    work: Option<Work>,
    unresolved: usize,
    dependents: Vec<TaskId>,
    /// Waiting for its `required_barrier` to be released.
    barrier_held: bool,
    submitted: Instant,
    started: Option<Instant>,
    worker: Option<usize>,
}

type Ready = Vec<(TaskId, TaskPriority)>;

#[derive(Default)]
struct Graph {
    live: HashMap<TaskId, Node>,
    finished: HashMap<TaskId, TaskRecord>,
    finished_order: VecDeque<TaskId>,
    barrier_wait: HashMap<BarrierType, Vec<TaskId>>,
    /// Outcome tallies, bumped in the same critical section that retires a task.
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl Graph {
    /// Move a live task to the finished map and resolve its dependents.
    fn settle(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        error: Option<TaskError>,
        retention: usize,
    ) -> Option<(TaskRecord, Ready)> {
        let node = self.live.remove(&id)?;
        let now = Instant::now();

        let mut ready = Vec::new();
        for dep in &node.dependents {
            if let Some(d) = self.live.get_mut(dep) {
                d.unresolved = d.unresolved.saturating_sub(1);
                if d.unresolved == 0 && d.status == TaskStatus::Pending && !d.barrier_held {
                    d.status = TaskStatus::Scheduled;
                    ready.push((*dep, d.priority));
                }
            }
        }

        let record = TaskRecord {
            handle: TaskHandle(id),
            name: node.name,
            domain: node.domain,
            priority: node.priority,
            status,
            worker: node.worker,
            estimated: node.estimated,
            queued: node.started.unwrap_or(now).saturating_duration_since(node.submitted),
            actual: node.started.map(|s| now.saturating_duration_since(s)),
            error,
        };

        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            _ => self.cancelled += 1,
        }
        self.finished.insert(id, record.clone());
        self.finished_order.push_back(id);
        while self.finished_order.len() > retention {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
        Some((record, ready))
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    steals: AtomicU64,
    barriers_released: AtomicU64,
    running: AtomicUsize,
    busy_us: AtomicU64,
    latency_samples: AtomicU64,
    latency_peak_us: AtomicU64,
}

impl Counters {
    fn record_latency(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.busy_us.fetch_add(us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.latency_peak_us.fetch_max(us, Ordering::Relaxed);
    }
}

const IDLE_PARK: Duration = Duration::from_millis(10);

struct Shared {
    cfg: ExecutorConfig,
    graph: Mutex<Graph>,
    settled: Condvar,
    urgent: Injector<TaskId>,
    normal: Injector<TaskId>,
    stealers: Vec<Stealer<TaskId>>,
    wake: Mutex<u64>,
    wake_cv: Condvar,
    shutdown: AtomicBool,
    run_cancelled: Arc<AtomicBool>,
    next_id: AtomicU64,
    counters: Counters,
    profiler: Profiler,
    completions: EventBus<TaskCompletion>,
    started_at: Instant,
}

impl Shared {
    fn wake_workers(&self) {
        {
            let mut epoch = self.wake.lock();
            *epoch = epoch.wrapping_add(1);
        }
        self.wake_cv.notify_all();
    }

    fn enqueue(&self, ready: &[(TaskId, TaskPriority)], local: Option<&Worker<TaskId>>) {
        if ready.is_empty() {
            return;
        }
        for &(id, priority) in ready {
            match local {
                Some(deque) => deque.push(id),
                None if priority.is_urgent() => self.urgent.push(id),
                None => self.normal.push(id),
            }
        }
        self.wake_workers();
    }

    fn find_task(&self, local: &Worker<TaskId>, me: usize) -> Option<TaskId> {
        if let Some(id) = local.pop() {
            return Some(id);
        }
        loop {
            let mut retry = false;
            for injector in [&self.urgent, &self.normal] {
                match injector.steal_batch_and_pop(local) {
                    Steal::Success(id) => return Some(id),
                    Steal::Retry => retry = true,
                    Steal::Empty => {}
                }
            }
            for (victim, stealer) in self.stealers.iter().enumerate() {
                if victim == me {
                    continue;
                }
                match stealer.steal() {
                    Steal::Success(id) => {
                        self.counters.steals.fetch_add(1, Ordering::Relaxed);
                        self.profiler.work_steal(me, victim);
                        return Some(id);
                    }
                    Steal::Retry => retry = true,
                    Steal::Empty => {}
                }
            }
            if !retry {
                return None;
            }
        }
    }

    fn run_task(&self, id: TaskId, worker: usize, local: &Worker<TaskId>) {
        let claimed = {
            let mut graph = self.graph.lock();
            match graph.live.get_mut(&id) {
                // Cancelled or already taken; the queue entry is stale.
                None => return,
                Some(node) if node.status != TaskStatus::Scheduled => return,
                Some(node) => {
                    node.status = TaskStatus::Running;
                    node.started = Some(Instant::now());
                    node.worker = Some(worker);
                    node.work.take().map(|w| (w, node.name.clone(), node.domain))
                }
            }
        };
        let Some((work, name, domain)) = claimed else {
            self.finish(id, TaskStatus::Failed, Some(TaskError::failed("task body missing")), Some(local));
            return;
        };

        self.counters.running.fetch_add(1, Ordering::SeqCst);
        let ctx = TaskContext {
            handle: TaskHandle(id),
            worker,
            run_cancelled: Arc::clone(&self.run_cancelled),
        };
        let start = Instant::now();
        let start_us = self.profiler.task_started(&name, worker, domain);

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&ctx))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };

        self.profiler.task_finished(&name, worker, domain, start_us, outcome.is_ok());
        self.counters.record_latency(start.elapsed());
        self.counters.running.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => self.finish(id, TaskStatus::Completed, None, Some(local)),
            Err(err) => self.finish(id, TaskStatus::Failed, Some(err), Some(local)),
        }
    }

    fn finish(&self, id: TaskId, status: TaskStatus, error: Option<TaskError>, local: Option<&Worker<TaskId>>) {
        let settled = self.retire(&mut self.graph.lock(), id, status, error);
        if let Some((record, ready)) = settled {
            self.after_settle(record, &ready, local);
        }
    }

    /// Settle a task and publish its completion while the graph lock is held,
    /// so anyone who sees it retired can also see the completion.
    fn retire(
        &self,
        graph: &mut Graph,
        id: TaskId,
        status: TaskStatus,
        error: Option<TaskError>,
    ) -> Option<(TaskRecord, Ready)> {
        let (record, ready) = graph.settle(id, status, error, self.cfg.completed_retention)?;
        self.completions.publish(TaskCompletion::from(&record));
        Some((record, ready))
    }

    fn after_settle(&self, record: TaskRecord, ready: &[(TaskId, TaskPriority)], local: Option<&Worker<TaskId>>) {
        self.settled.notify_all();

        if record.status == TaskStatus::Failed {
            if let Some(err) = &record.error {
                warn!(task = %record.name, handle = record.handle.id(), error = %err, "task failed");
            }
        }

        self.enqueue(ready, local);
    }

    /// Block until `outstanding` reports zero or the timeout passes.
    fn wait_settled(
        &self,
        what: &'static str,
        timeout: Duration,
        outstanding: impl Fn(&Graph) -> usize,
    ) -> Result<(), TimeoutError> {
        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let mut graph: MutexGuard<'_, Graph> = self.graph.lock();
        loop {
            let left = outstanding(&graph);
            if left == 0 {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.settled.wait_until(&mut graph, deadline).timed_out() {
                        let left = outstanding(&graph);
                        if left == 0 {
                            return Ok(());
                        }
                        return Err(TimeoutError {
                            what,
                            waited: start.elapsed(),
                            outstanding: left,
                        });
                    }
                }
                None => self.settled.wait(&mut graph),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize, local: Worker<TaskId>) {
    debug!(worker = index, "worker started");
    while !shared.shutdown.load(Ordering::Acquire) {
        let seen = *shared.wake.lock();
        match shared.find_task(&local, index) {
            Some(id) => shared.run_task(id, index, &local),
            None => {
                let mut epoch = shared.wake.lock();
                if *epoch == seen && !shared.shutdown.load(Ordering::Acquire) {
                    shared.wake_cv.wait_for(&mut epoch, IDLE_PARK);
                }
            }
        }
    }
    debug!(worker = index, "worker stopped");
}

pub struct TaskGraphExecutor {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl TaskGraphExecutor {
    pub fn new(cfg: ExecutorConfig) -> Result<Self, EchoError> {
        let workers = cfg.workers.max(1);
        let locals: Vec<Worker<TaskId>> = (0..workers).map(|_| Worker::new_lifo()).collect();
        let stealers = locals.iter().map(|w| w.stealer()).collect();

        let profiler = Profiler::new(cfg.profile_capacity, workers);
        profiler.set_enabled(cfg.profiling);

        let shared = Arc::new(Shared {
            cfg: ExecutorConfig { workers, ..cfg },
            graph: Mutex::new(Graph::default()),
            settled: Condvar::new(),
            urgent: Injector::new(),
            normal: Injector::new(),
            stealers,
            wake: Mutex::new(0),
            wake_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            run_cancelled: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(0),
            counters: Counters::default(),
            profiler,
            completions: EventBus::new(),
            started_at: Instant::now(),
        });

        let mut threads = Vec::with_capacity(workers);
        for (index, local) in locals.into_iter().enumerate() {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("echobeats-worker-{index}"))
                .spawn(move || worker_loop(worker_shared, index, local))
                .map_err(|e| EchoError::Spawn(e.to_string()));
            match handle {
                Ok(h) => threads.push(h),
                Err(err) => {
                    // Stop whatever already started before bailing out.
                    let partial = Self {
                        shared: Arc::clone(&shared),
                        threads,
                    };
                    drop(partial);
                    return Err(err);
                }
            }
        }

        info!(workers, max_pending = shared.cfg.max_pending_tasks, "task graph executor started");
        Ok(Self { shared, threads })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.cfg
    }

    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    pub fn profiler(&self) -> &Profiler {
        &self.shared.profiler
    }

    pub fn subscribe_completions(&self, capacity: usize) -> Subscription<TaskCompletion> {
        self.shared.completions.subscribe(capacity)
    }

    /// Queue a task. Fails fast with `CapacityError` once `max_pending_tasks`
    /// unfinished tasks exist; nothing already queued is dropped.
    pub fn submit<F>(&self, desc: TaskDescriptor, work: F) -> Result<TaskHandle, EchoError>
    where
        F: FnOnce(&TaskContext) -> Result<(), TaskError> + Send + 'static,
    {
        let shared = &self.shared;
        if shared.run_cancelled.load(Ordering::Acquire) {
            return Err(EchoError::Cancelled);
        }

        let mut graph = shared.graph.lock();
        let pending = graph.live.len();
        if pending >= shared.cfg.max_pending_tasks {
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CapacityError {
                pending,
                max: shared.cfg.max_pending_tasks,
            }
            .into());
        }

        let mut deps = desc.dependencies;
        deps.sort_unstable();
        deps.dedup();
        let issued = shared.next_id.load(Ordering::Relaxed);
        if let Some(bad) = deps.iter().find(|h| h.0 >= issued) {
            return Err(EchoError::UnknownTask(bad.0));
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut unresolved = 0;
        for dep in &deps {
            if let Some(node) = graph.live.get_mut(&dep.0) {
                node.dependents.push(id);
                unresolved += 1;
            }
        }

        let barrier_held = desc.required_barrier.is_some();
        if let Some(barrier) = desc.required_barrier {
            graph.barrier_wait.entry(barrier).or_default().push(id);
        }
        let status = if unresolved == 0 && !barrier_held {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };

        graph.live.insert(
            id,
            Node {
                name: desc.name,
                domain: desc.domain,
                priority: desc.priority,
                estimated: desc.estimated,
                status,
                work: Some(Box::new(work)),
                unresolved,
                dependents: Vec::new(),
                barrier_held,
                submitted: Instant::now(),
                started: None,
                worker: None,
            },
        );
        drop(graph);

        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if status == TaskStatus::Scheduled {
            shared.enqueue(&[(id, desc.priority)], None);
        }
        Ok(TaskHandle(id))
    }

    /// Best effort: only tasks that have not started can be cancelled.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        let shared = &self.shared;
        let settled = {
            let mut graph = shared.graph.lock();
            match graph.live.get(&handle.0).map(|n| n.status) {
                Some(TaskStatus::Pending) | Some(TaskStatus::Scheduled) => {
                    shared.retire(&mut graph, handle.0, TaskStatus::Cancelled, Some(TaskError::Cancelled))
                }
                _ => None,
            }
        };
        match settled {
            Some((record, ready)) => {
                shared.after_settle(record, &ready, None);
                true
            }
            None => false,
        }
    }

    /// Let every task currently held for `barrier` become schedulable.
    /// Tasks submitted afterwards wait for the next release.
    pub fn release_barrier(&self, barrier: BarrierType) -> usize {
        let shared = &self.shared;
        let (released, ready) = {
            let mut graph = shared.graph.lock();
            let held = graph.barrier_wait.remove(&barrier).unwrap_or_default();
            let mut released = 0;
            let mut ready = Vec::new();
            for id in held {
                if let Some(node) = graph.live.get_mut(&id) {
                    if !node.barrier_held {
                        continue;
                    }
                    node.barrier_held = false;
                    released += 1;
                    if node.unresolved == 0 && node.status == TaskStatus::Pending {
                        node.status = TaskStatus::Scheduled;
                        ready.push((id, node.priority));
                    }
                }
            }
            (released, ready)
        };
        shared.counters.barriers_released.fetch_add(1, Ordering::Relaxed);
        shared.profiler.sync_barrier(barrier.as_str());
        shared.enqueue(&ready, None);
        debug!(barrier = barrier.as_str(), released, "barrier released");
        released
    }

    /// Release just `handles` from whatever barrier holds them. Handles that
    /// are not held are skipped.
    pub fn release_tasks(&self, handles: &[TaskHandle]) -> usize {
        let shared = &self.shared;
        let (released, ready) = {
            let mut graph = shared.graph.lock();
            let mut released = 0;
            let mut ready = Vec::new();
            for handle in handles {
                let Some(node) = graph.live.get_mut(&handle.0) else {
                    continue;
                };
                if !node.barrier_held {
                    continue;
                }
                node.barrier_held = false;
                released += 1;
                if node.unresolved == 0 && node.status == TaskStatus::Pending {
                    node.status = TaskStatus::Scheduled;
                    ready.push((handle.0, node.priority));
                }
            }
            for held in graph.barrier_wait.values_mut() {
                held.retain(|id| !handles.iter().any(|h| h.0 == *id));
            }
            (released, ready)
        };
        shared.enqueue(&ready, None);
        released
    }

    /// Block until no submitted task is unfinished.
    pub fn wait_all(&self, timeout: Duration) -> Result<(), TimeoutError> {
        self.shared.wait_settled("wait_all", timeout, |g| g.live.len())
    }

    /// Block until each of `handles` is finished (unknown handles count as finished).
    pub fn wait_for(&self, handles: &[TaskHandle], timeout: Duration) -> Result<(), TimeoutError> {
        self.shared.wait_settled("wait_for", timeout, |g| {
            handles.iter().filter(|h| g.live.contains_key(&h.0)).count()
        })
    }

    /// `None` for handles never issued or already evicted from retention.
    pub fn status(&self, handle: TaskHandle) -> Option<TaskStatus> {
        let graph = self.shared.graph.lock();
        graph
            .live
            .get(&handle.0)
            .map(|n| n.status)
            .or_else(|| graph.finished.get(&handle.0).map(|r| r.status))
    }

    pub fn record(&self, handle: TaskHandle) -> Option<TaskRecord> {
        self.shared.graph.lock().finished.get(&handle.0).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.graph.lock().live.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.run_cancelled.load(Ordering::Acquire)
    }

    /// Cancel the whole run: drain the ready queues, cancel everything not yet
    /// started, then wait for in-flight tasks. Terminal; later submissions fail.
    pub fn cancel_run(&self) -> usize {
        let shared = &self.shared;
        shared.run_cancelled.store(true, Ordering::Release);

        for injector in [&shared.urgent, &shared.normal] {
            loop {
                match injector.steal() {
                    Steal::Success(_) | Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }

        let records = {
            let mut graph = shared.graph.lock();
            let mut waiting: Vec<TaskId> = graph
                .live
                .iter()
                .filter(|(_, n)| matches!(n.status, TaskStatus::Pending | TaskStatus::Scheduled))
                .map(|(&id, _)| id)
                .collect();
            waiting.sort_unstable();
            graph.barrier_wait.clear();
            waiting
                .into_iter()
                .filter_map(|id| shared.retire(&mut graph, id, TaskStatus::Cancelled, Some(TaskError::Cancelled)))
                .map(|(record, _)| record)
                .collect::<Vec<_>>()
        };
        let cancelled = records.len();
        for record in records {
            shared.after_settle(record, &[], None);
        }

        // In-flight tasks run to completion; nothing is forcibly stopped.
        let _ = shared.wait_settled("cancel_run", Duration::MAX, |g| g.live.len());
        info!(cancelled, "run cancelled");
        cancelled
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        let c = &self.shared.counters;
        let (live, completed, failed, cancelled) = {
            let graph = self.shared.graph.lock();
            (graph.live.len(), graph.completed, graph.failed, graph.cancelled)
        };
        let running = c.running.load(Ordering::SeqCst);
        let samples = c.latency_samples.load(Ordering::Relaxed);
        let busy = c.busy_us.load(Ordering::Relaxed);
        let submitted = c.submitted.load(Ordering::Relaxed);
        let rejected = c.rejected.load(Ordering::Relaxed);
        let workers = self.threads.len().max(1);
        let wall_us = self.shared.started_at.elapsed().as_micros().max(1) as f64;
        let attempts = submitted + rejected;

        ExecutorMetrics {
            workers,
            submitted,
            completed,
            failed,
            cancelled,
            rejected,
            steals: c.steals.load(Ordering::Relaxed),
            running,
            pending: live.saturating_sub(running),
            barriers_released: c.barriers_released.load(Ordering::Relaxed),
            avg_latency_us: if samples == 0 {
                0.0
            } else {
                busy as f64 / samples as f64
            },
            peak_latency_us: c.latency_peak_us.load(Ordering::Relaxed),
            utilization: (busy as f64 / (wall_us * workers as f64)).min(1.0),
            saturation: if attempts == 0 {
                0.0
            } else {
                rejected as f64 / attempts as f64
            },
        }
    }
}

impl Drop for TaskGraphExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_workers();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug!("task graph executor stopped");
    }
}
