//! echobeats daemon - runs one cognitive engine in the background.
//!
//! The engine steps at its configured pace while running; clients connect
//! over TCP and exchange newline-delimited JSON requests and responses.
//!
//! Config file: `<config dir>/echobeats/config.json`, loaded at startup and
//! rewritten when the cycle duration changes.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use echobeats::config::EngineConfig;
use echobeats::engine::CognitiveEngine;
use echobeats::error::EchoError;
use echobeats::events::{EngineEvent, Subscription};
use echobeats::observer::{EngineAdapter, EngineSnapshot};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod error;
mod paths;

use error::DaemonError;
use paths::AppPaths;

const LISTEN_ADDR: &str = "127.0.0.1:9877";
const MAX_MANUAL_STEPS: u32 = 1200;

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetState,
    Start,
    Stop,
    Feed {
        #[serde(default)]
        stream: Option<usize>,
        vector: Vec<f64>,
    },
    Step { count: u32 },
    SetCycleDuration { secs: f64 },
    ExportTrace {
        #[serde(default)]
        path: Option<String>,
    },
    Reset,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    State(StateSnapshot),
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateSnapshot {
    running: bool,
    events: EventTally,
    engine: EngineSnapshot,
}

/// Running totals of engine events seen by the daemon.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct EventTally {
    cycles_completed: u64,
    mode_changes: u64,
    syncs: u64,
    partial_syncs: u64,
    relevance_realized: u64,
    last_quality: f64,
}

impl EventTally {
    fn record(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::CycleCompleted { .. } => self.cycles_completed += 1,
            EngineEvent::ModeChanged { .. } => self.mode_changes += 1,
            EngineEvent::TriadicSync { quality, partial, .. } => {
                self.syncs += 1;
                if *partial {
                    self.partial_syncs += 1;
                }
                self.last_quality = *quality;
            }
            EngineEvent::RelevanceRealized { .. } => self.relevance_realized += 1,
            _ => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Daemon State
// ═══════════════════════════════════════════════════════════════════════════

struct DaemonState {
    engine: CognitiveEngine,
    events: Subscription<EngineEvent>,
    tally: EventTally,
    running: bool,
    paths: AppPaths,
}

impl DaemonState {
    fn new(paths: AppPaths, cfg: EngineConfig) -> Result<Self, DaemonError> {
        let (engine, events) = build_engine(cfg)?;
        Ok(Self {
            engine,
            events,
            tally: EventTally::default(),
            running: false,
            paths,
        })
    }

    fn step_interval(&self) -> Duration {
        self.engine.config().step_duration()
    }

    fn absorb_events(&mut self) {
        for event in self.events.drain() {
            self.tally.record(&event);
        }
    }

    fn tick(&mut self) -> Result<(), EchoError> {
        let result = self.engine.tick().map(|_| ());
        self.absorb_events();
        result
    }

    fn run_steps(&mut self, count: u32) -> Result<(), EchoError> {
        let result = self.engine.run_steps(count as usize).map(|_| ());
        self.absorb_events();
        result
    }

    fn snapshot(&mut self) -> StateSnapshot {
        let engine = EngineAdapter::new(&self.engine).snapshot();
        self.absorb_events();
        StateSnapshot {
            running: self.running,
            events: self.tally,
            engine,
        }
    }

    /// Swap in an engine built from `cfg`. The old one is cancelled only once
    /// the new config has been accepted.
    fn rebuild(&mut self, cfg: EngineConfig) -> Result<(), DaemonError> {
        let (engine, events) = build_engine(cfg)?;
        let mut old = std::mem::replace(&mut self.engine, engine);
        old.cancel();
        self.events = events;
        self.tally = EventTally::default();
        Ok(())
    }

    fn save_config(&self) -> Result<(), DaemonError> {
        let path = self.paths.config_file();
        fs::write(&path, self.engine.config().to_json_pretty()).map_err(|e| DaemonError::io(&path, e))?;
        info!("Config saved to {:?}", path);
        Ok(())
    }
}

fn build_engine(cfg: EngineConfig) -> Result<(CognitiveEngine, Subscription<EngineEvent>), DaemonError> {
    let builder = CognitiveEngine::builder(cfg);
    let events = builder.subscribe_default();
    Ok((builder.build()?, events))
}

fn load_config(paths: &AppPaths) -> EngineConfig {
    let path = paths.config_file();
    if !path.exists() {
        info!("No config at {:?}, using defaults", path);
        return EngineConfig::default();
    }
    match EngineConfig::load(&path) {
        Ok(cfg) => {
            info!("Config loaded from {:?}", path);
            cfg
        }
        Err(e) => {
            warn!("Ignoring config {:?}: {}", path, e);
            EngineConfig::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

fn success(message: impl Into<String>) -> Response {
    Response::Success {
        message: message.into(),
    }
}

fn failure(message: impl std::fmt::Display) -> Response {
    Response::Error {
        message: message.to_string(),
    }
}

async fn handle_request(request: Request, state: &RwLock<DaemonState>) -> Response {
    // Engine calls block on the worker pool, so they run in place off the
    // async scheduler.
    match request {
        Request::GetState => {
            let mut s = state.write().await;
            Response::State(task::block_in_place(|| s.snapshot()))
        }
        Request::Start => {
            let mut s = state.write().await;
            s.running = true;
            success("Started")
        }
        Request::Stop => {
            let mut s = state.write().await;
            s.running = false;
            success("Stopped")
        }
        Request::Feed { stream, vector } => {
            let mut s = state.write().await;
            let len = vector.len();
            match task::block_in_place(|| s.engine.process_input(stream, vector)) {
                Ok(handle) => success(format!("Queued {len} values as task {}", handle.id())),
                Err(e) => failure(e),
            }
        }
        Request::Step { count } => {
            let mut s = state.write().await;
            let count = count.clamp(1, MAX_MANUAL_STEPS);
            match task::block_in_place(|| s.run_steps(count)) {
                Ok(()) => success(format!(
                    "Ran {count} steps, now step {} cycle {}",
                    s.engine.step(),
                    s.engine.cycle_count()
                )),
                Err(e) => failure(e),
            }
        }
        Request::SetCycleDuration { secs } => {
            let mut s = state.write().await;
            let cfg = s.engine.config().clone().with_cycle_duration(secs);
            let rebuilt = task::block_in_place(|| s.rebuild(cfg));
            match rebuilt.and_then(|_| s.save_config()) {
                Ok(()) => {
                    info!("Cycle duration set to {secs}s");
                    success(format!("Cycle duration set to {secs}s (engine restarted)"))
                }
                Err(e) => failure(e),
            }
        }
        Request::ExportTrace { path } => {
            let s = state.read().await;
            let path = path.map(Into::into).unwrap_or_else(|| s.paths.trace_file());
            match task::block_in_place(|| s.engine.export_trace(&path)) {
                Ok(()) => success(format!("Trace written to {}", path.display())),
                Err(e) => failure(e),
            }
        }
        Request::Reset => {
            let mut s = state.write().await;
            match task::block_in_place(|| s.engine.reset()) {
                Ok(()) => {
                    s.tally = EventTally::default();
                    success("Engine reset")
                }
                Err(e) => failure(e),
            }
        }
        Request::Shutdown => {
            let mut s = state.write().await;
            s.running = false;
            if let Err(e) = s.save_config() {
                warn!("Shutdown without saving config: {}", e);
            }
            let dropped = task::block_in_place(|| s.engine.cancel());
            info!(dropped, "Shutdown requested");
            tokio::spawn(async {
                // Give the response a moment to flush before exiting.
                time::sleep(Duration::from_millis(50)).await;
                std::process::exit(0);
            });
            success("Shutting down")
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<RwLock<DaemonState>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(request, &state).await,
            Err(e) => failure(DaemonError::from(e)),
        };
        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let paths = AppPaths::new()?;
    info!("Config directory: {:?}", paths.dir());
    let cfg = load_config(&paths);
    let state = Arc::new(RwLock::new(DaemonState::new(paths, cfg)?));

    // Ctrl-C cancels the run: queued tasks drain, in-flight ones finish.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let mut s = state.write().await;
                s.running = false;
                let dropped = task::block_in_place(|| s.engine.cancel());
                info!(dropped, "Ctrl-C: run cancelled");
                std::process::exit(0);
            }
        });
    }

    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    info!("echobeats daemon listening on {}", LISTEN_ADDR);

    // Step loop
    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let interval = state_clone.read().await.step_interval();
            time::sleep(interval).await;

            let mut s = state_clone.write().await;
            if !s.running {
                continue;
            }
            if let Err(e) = task::block_in_place(|| s.tick()) {
                match e {
                    EchoError::Cancelled => break,
                    e => {
                        warn!("Step failed, pausing: {}", e);
                        s.running = false;
                    }
                }
            }
        }
    });

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Client connected: {}", addr);
        let state_clone = Arc::clone(&state);

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, state_clone).await {
                error!("Client handler error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echobeats::clock::CognitiveMode;

    #[test]
    fn requests_use_tagged_json() {
        let feed: Request = serde_json::from_str(r#"{"type":"Feed","vector":[0.5,-0.5]}"#).unwrap();
        match feed {
            Request::Feed { stream, vector } => {
                assert_eq!(stream, None);
                assert_eq!(vector, vec![0.5, -0.5]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let line = serde_json::to_string(&Request::Step { count: 3 }).unwrap();
        assert_eq!(line, r#"{"type":"Step","count":3}"#);
    }

    #[test]
    fn tally_counts_sync_events() {
        let mut tally = EventTally::default();
        tally.record(&EngineEvent::TriadicSync {
            triad_index: 1,
            step: 5,
            quality: 0.8,
            partial: true,
            participants: vec![0, 1],
        });
        tally.record(&EngineEvent::CycleCompleted { cycle: 1 });
        tally.record(&EngineEvent::ModeChanged {
            old: CognitiveMode::Expressive,
            new: CognitiveMode::Reflective,
            step: 6,
        });
        assert_eq!((tally.syncs, tally.partial_syncs, tally.cycles_completed), (1, 1, 1));
        assert_eq!(tally.mode_changes, 1);
        assert!((tally.last_quality - 0.8).abs() < 1e-12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn feed_is_handled_on_a_multi_thread_runtime() {
        let root = std::env::temp_dir().join(format!("echobeatsd-feed-{}", std::process::id()));
        let paths = AppPaths::at(&root).unwrap();
        let cfg = EngineConfig::default()
            .with_workers(2)
            .map_reservoirs(|r| r.with_units(16));
        let state = RwLock::new(DaemonState::new(paths, cfg).unwrap());

        let queued = handle_request(
            Request::Feed {
                stream: Some(1),
                vector: vec![0.4; 8],
            },
            &state,
        )
        .await;
        assert!(matches!(queued, Response::Success { .. }), "{queued:?}");

        let unknown = handle_request(
            Request::Feed {
                stream: Some(9),
                vector: vec![0.4],
            },
            &state,
        )
        .await;
        assert!(matches!(unknown, Response::Error { .. }), "{unknown:?}");
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn rebuild_rejects_bad_duration_and_keeps_engine() {
        let root = std::env::temp_dir().join(format!("echobeatsd-state-{}", std::process::id()));
        let paths = AppPaths::at(&root).unwrap();
        let cfg = EngineConfig::default()
            .with_workers(2)
            .map_reservoirs(|r| r.with_units(16));
        let mut state = DaemonState::new(paths, cfg.clone()).unwrap();
        state.run_steps(4).unwrap();

        assert!(state.rebuild(cfg.clone().with_cycle_duration(-1.0)).is_err());
        assert_eq!(state.engine.step(), 5);
        assert_eq!(state.tally.syncs, 1);

        state.rebuild(cfg.with_cycle_duration(6.0)).unwrap();
        assert_eq!(state.engine.step(), 1);
        assert_eq!(state.step_interval(), Duration::from_millis(500));
        fs::remove_dir_all(&root).ok();
    }
}
