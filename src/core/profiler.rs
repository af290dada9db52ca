//! Task-level profiling: a bounded ring of timestamped events plus running
//! per-worker and per-domain aggregates. Exports plain JSON or the Chrome
//! `traceEvents` format.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::Mutex;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::executor::TaskDomain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProfileEventKind {
    TaskStart,
    TaskEnd,
    SyncBarrier,
    WorkSteal,
    GraphSubmit,
    GraphComplete,
}

impl ProfileEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskStart => "task_start",
            Self::TaskEnd => "task_end",
            Self::SyncBarrier => "sync_barrier",
            Self::WorkSteal => "work_steal",
            Self::GraphSubmit => "graph_submit",
            Self::GraphComplete => "graph_complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProfileEvent {
    pub kind: ProfileEventKind,
    pub name: String,
    pub worker: Option<usize>,
    pub domain: Option<TaskDomain>,
    /// Microseconds since the profiler was created. For `TaskEnd` this is the
    /// task's start time so that `ts_us + duration_us` is its end.
    pub ts_us: u64,
    pub duration_us: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorkerStats {
    pub worker: usize,
    pub tasks: u64,
    pub failed: u64,
    pub busy_us: u64,
    pub steals: u64,
    /// Busy time over wall time since the profiler started.
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DomainStats {
    pub domain: TaskDomain,
    pub count: u64,
    pub total_us: u64,
    pub avg_us: f64,
    pub peak_us: u64,
    /// Share of all profiled task time spent in this domain.
    pub share: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct DomainAccum {
    count: u64,
    total_us: u64,
    peak_us: u64,
}

pub struct Profiler {
    epoch: Instant,
    enabled: AtomicBool,
    capacity: usize,
    events: Mutex<VecDeque<ProfileEvent>>,
    workers: Mutex<Vec<WorkerStats>>,
    domains: Mutex<HashMap<TaskDomain, DomainAccum>>,
}

impl Profiler {
    pub fn new(capacity: usize, workers: usize) -> Self {
        Self {
            epoch: Instant::now(),
            enabled: AtomicBool::new(true),
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            workers: Mutex::new(
                (0..workers)
                    .map(|worker| WorkerStats {
                        worker,
                        ..WorkerStats::default()
                    })
                    .collect(),
            ),
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn push(&self, event: ProfileEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn mark(&self, kind: ProfileEventKind, name: &str, worker: Option<usize>, domain: Option<TaskDomain>) {
        if !self.is_enabled() {
            return;
        }
        self.push(ProfileEvent {
            kind,
            name: name.to_string(),
            worker,
            domain,
            ts_us: self.now_us(),
            duration_us: 0,
        });
    }

    /// Returns the start timestamp to hand back to [`Profiler::task_finished`].
    pub fn task_started(&self, name: &str, worker: usize, domain: TaskDomain) -> u64 {
        let ts = self.now_us();
        if self.is_enabled() {
            self.push(ProfileEvent {
                kind: ProfileEventKind::TaskStart,
                name: name.to_string(),
                worker: Some(worker),
                domain: Some(domain),
                ts_us: ts,
                duration_us: 0,
            });
        }
        ts
    }

    pub fn task_finished(&self, name: &str, worker: usize, domain: TaskDomain, start_us: u64, ok: bool) {
        if !self.is_enabled() {
            return;
        }
        let duration_us = self.now_us().saturating_sub(start_us);
        self.push(ProfileEvent {
            kind: ProfileEventKind::TaskEnd,
            name: name.to_string(),
            worker: Some(worker),
            domain: Some(domain),
            ts_us: start_us,
            duration_us,
        });

        if let Some(stats) = self.workers.lock().get_mut(worker) {
            stats.tasks += 1;
            stats.busy_us += duration_us;
            if !ok {
                stats.failed += 1;
            }
        }

        let mut domains = self.domains.lock();
        let acc = domains.entry(domain).or_default();
        acc.count += 1;
        acc.total_us += duration_us;
        acc.peak_us = acc.peak_us.max(duration_us);
    }

    pub fn work_steal(&self, thief: usize, victim: usize) {
        if let Some(stats) = self.workers.lock().get_mut(thief) {
            stats.steals += 1;
        }
        self.mark(ProfileEventKind::WorkSteal, &format!("steal from {victim}"), Some(thief), None);
    }

    pub fn sync_barrier(&self, name: &str) {
        self.mark(ProfileEventKind::SyncBarrier, name, None, None);
    }

    pub fn graph_submitted(&self, name: &str) {
        self.mark(ProfileEventKind::GraphSubmit, name, None, None);
    }

    pub fn graph_completed(&self, name: &str) {
        self.mark(ProfileEventKind::GraphComplete, name, None, None);
    }

    pub fn events(&self) -> Vec<ProfileEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        let elapsed = self.now_us().max(1) as f64;
        self.workers
            .lock()
            .iter()
            .map(|w| WorkerStats {
                utilization: (w.busy_us as f64 / elapsed).min(1.0),
                ..*w
            })
            .collect()
    }

    pub fn domain_stats(&self) -> Vec<DomainStats> {
        let domains = self.domains.lock();
        let total: u64 = domains.values().map(|d| d.total_us).sum();
        let mut out: Vec<DomainStats> = domains
            .iter()
            .map(|(&domain, acc)| DomainStats {
                domain,
                count: acc.count,
                total_us: acc.total_us,
                avg_us: acc.total_us as f64 / acc.count.max(1) as f64,
                peak_us: acc.peak_us,
                share: if total == 0 {
                    0.0
                } else {
                    acc.total_us as f64 / total as f64
                },
            })
            .collect();
        out.sort_by(|a, b| b.total_us.cmp(&a.total_us).then(a.count.cmp(&b.count)));
        out
    }

    pub fn clear(&self) {
        self.events.lock().clear();
        for w in self.workers.lock().iter_mut() {
            *w = WorkerStats {
                worker: w.worker,
                ..WorkerStats::default()
            };
        }
        self.domains.lock().clear();
    }

    /// Events plus aggregates as one JSON document.
    pub fn export_json<W: Write>(&self, writer: W) -> io::Result<()> {
        let events: Vec<Value> = self.events().iter().map(event_json).collect();
        let workers: Vec<Value> = self
            .worker_stats()
            .iter()
            .map(|w| {
                json!({
                    "worker": w.worker,
                    "tasks": w.tasks,
                    "failed": w.failed,
                    "busy_us": w.busy_us,
                    "steals": w.steals,
                    "utilization": w.utilization,
                })
            })
            .collect();
        let domains: Vec<Value> = self
            .domain_stats()
            .iter()
            .map(|d| {
                json!({
                    "domain": d.domain.as_str(),
                    "count": d.count,
                    "total_us": d.total_us,
                    "avg_us": d.avg_us,
                    "peak_us": d.peak_us,
                    "share": d.share,
                })
            })
            .collect();
        let doc = json!({ "events": events, "workers": workers, "domains": domains });
        serde_json::to_writer_pretty(writer, &doc).map_err(io::Error::other)
    }

    /// Chrome trace viewer format: one complete (`"X"`) event per finished
    /// task, instant (`"i"`) events for barriers, steals and graph marks.
    pub fn export_chrome_trace<W: Write>(&self, writer: W) -> io::Result<()> {
        let trace: Vec<Value> = self
            .events()
            .iter()
            .filter(|e| e.kind != ProfileEventKind::TaskStart)
            .map(|e| {
                let tid = e.worker.map(|w| w as i64).unwrap_or(-1);
                let cat = e.domain.map(|d| d.as_str()).unwrap_or(e.kind.as_str());
                if e.kind == ProfileEventKind::TaskEnd {
                    json!({
                        "name": e.name,
                        "cat": cat,
                        "ph": "X",
                        "ts": e.ts_us,
                        "dur": e.duration_us,
                        "pid": 1,
                        "tid": tid,
                    })
                } else {
                    json!({
                        "name": e.name,
                        "cat": cat,
                        "ph": "i",
                        "s": "g",
                        "ts": e.ts_us,
                        "pid": 1,
                        "tid": tid,
                    })
                }
            })
            .collect();
        let doc = json!({ "traceEvents": trace, "displayTimeUnit": "ms" });
        serde_json::to_writer(writer, &doc).map_err(io::Error::other)
    }
}

fn event_json(e: &ProfileEvent) -> Value {
    json!({
        "kind": e.kind.as_str(),
        "name": e.name,
        "worker": e.worker,
        "domain": e.domain.map(|d| d.as_str()),
        "ts_us": e.ts_us,
        "duration_us": e.duration_us,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent() {
        let p = Profiler::new(3, 1);
        for i in 0..5 {
            p.graph_submitted(&format!("step {i}"));
        }
        let names: Vec<String> = p.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["step 2", "step 3", "step 4"]);
    }

    #[test]
    fn aggregates_by_worker_and_domain() {
        let p = Profiler::new(64, 2);
        let t0 = p.task_started("a", 0, TaskDomain::ReservoirCompute);
        p.task_finished("a", 0, TaskDomain::ReservoirCompute, t0, true);
        let t1 = p.task_started("b", 1, TaskDomain::Coherence);
        p.task_finished("b", 1, TaskDomain::Coherence, t1, false);
        p.work_steal(1, 0);

        let workers = p.worker_stats();
        assert_eq!(workers[0].tasks, 1);
        assert_eq!(workers[1].failed, 1);
        assert_eq!(workers[1].steals, 1);

        let domains = p.domain_stats();
        assert_eq!(domains.len(), 2);
        assert!(domains.iter().all(|d| d.count == 1));
        let share: f64 = domains.iter().map(|d| d.share).sum();
        assert!(share == 0.0 || (share - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_profiler_records_nothing() {
        let p = Profiler::new(8, 1);
        p.set_enabled(false);
        let t = p.task_started("x", 0, TaskDomain::Telemetry);
        p.task_finished("x", 0, TaskDomain::Telemetry, t, true);
        p.sync_barrier("TriadicSync");
        assert!(p.events().is_empty());
        assert_eq!(p.worker_stats()[0].tasks, 0);
    }

    #[test]
    fn chrome_trace_has_complete_events() {
        let p = Profiler::new(16, 1);
        let t = p.task_started("stream pivotal", 0, TaskDomain::ReservoirCompute);
        p.task_finished("stream pivotal", 0, TaskDomain::ReservoirCompute, t, true);
        p.sync_barrier("TriadicSync");

        let mut buf = Vec::new();
        p.export_chrome_trace(&mut buf).unwrap();
        let doc: Value = serde_json::from_slice(&buf).unwrap();
        let events = doc["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["ph"], "X");
        assert_eq!(events[0]["name"], "stream pivotal");
        assert_eq!(events[0]["tid"], 0);
        assert!(events[0]["dur"].is_u64());
        assert_eq!(events[1]["ph"], "i");

        let mut buf = Vec::new();
        p.export_json(&mut buf).unwrap();
        let doc: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(doc["domains"][0]["domain"], "reservoir_compute");
    }
}
