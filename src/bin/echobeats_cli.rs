//! CLI client for the `echobeatsd` daemon.
//!
//! Examples:
//!   echobeats-cli status
//!   echobeats-cli start
//!   echobeats-cli feed 0.2,0.4,-0.1
//!   echobeats-cli feed --stream 2 0.9,0.9
//!   echobeats-cli step 12
//!   echobeats-cli cycle 6
//!   echobeats-cli trace /tmp/echobeats-trace.json
//!
//! By default it talks to 127.0.0.1:9877; override with `--addr host:port`.

use echobeats::observer::EngineSnapshot;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetState,
    Start,
    Stop,
    Feed { stream: Option<usize>, vector: Vec<f64> },
    Step { count: u32 },
    SetCycleDuration { secs: f64 },
    ExportTrace { path: Option<String> },
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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventTally {
    cycles_completed: u64,
    #[serde(default)]
    mode_changes: u64,
    syncs: u64,
    partial_syncs: u64,
    relevance_realized: u64,
    last_quality: f64,
}

fn usage() -> ! {
    eprintln!("echobeats-cli (talks to echobeatsd @ 127.0.0.1:9877 by default)");
    eprintln!("Usage: echobeats-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                          Show engine state");
    eprintln!("  start | stop                    Control the step loop");
    eprintln!("  feed [--stream N] v1,v2,...     Send a sensory vector");
    eprintln!("  step [count]                    Run steps immediately (default 1)");
    eprintln!("  cycle <secs>                    Set cycle duration (restarts engine)");
    eprintln!("  trace [path]                    Export a Chrome trace");
    eprintln!("  reset                           Back to step 1 with initial states");
    eprintln!("  shutdown                        Save config and exit daemon");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = "127.0.0.1:9877".to_string();
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

fn parse_vector(s: &str) -> Result<Vec<f64>, String> {
    s.split(',')
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("bad value {p:?}: {e}")))
        .collect()
}

fn send_request(addr: &str, req: &Request) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn print_state(s: StateSnapshot) {
    let e = &s.engine;
    println!(
        "running={} cycle={} step={} type={:?} mode={:?} sync_point={}",
        s.running, e.cycle, e.step, e.step_config.step_type, e.step_config.mode, e.is_sync_point,
    );
    println!(
        "coherence={:.3} last_sync_quality={:.3} syncs={} partial={} realized={} cycles_seen={} mode_changes={}",
        e.aggregate_coherence,
        e.last_sync_quality,
        s.events.syncs,
        s.events.partial_syncs,
        s.events.relevance_realized,
        s.events.cycles_completed,
        s.events.mode_changes,
    );
    for st in &e.streams {
        println!(
            "  {:<12} phase={:>2} activation={:.3} coherence={:.3} attention={:.3} relevance={:.3}",
            st.name, st.current_phase, st.activation_level, st.coherence, st.attention, st.relevance,
        );
    }
    println!(
        "executor: workers={} completed={} failed={} rejected={} steals={} pending={} util={:.1}%",
        e.executor.workers,
        e.executor.completed,
        e.executor.failed,
        e.executor.rejected,
        e.executor.steals,
        e.executor.pending,
        e.executor.utilization * 100.0,
    );
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = &args[0];

    let make_error = |msg: &str| -> ! {
        eprintln!("{}", msg);
        process::exit(1);
    };

    let req = match cmd.as_str() {
        "status" => Request::GetState,
        "start" => Request::Start,
        "stop" => Request::Stop,
        "feed" => {
            let (stream, rest) = match args.get(1).map(String::as_str) {
                Some("--stream") => {
                    let id = args
                        .get(2)
                        .and_then(|s| s.parse::<usize>().ok())
                        .unwrap_or_else(|| make_error("--stream needs a stream index"));
                    (Some(id), &args[3.min(args.len())..])
                }
                _ => (None, &args[1..]),
            };
            let Some(values) = rest.first() else { usage() };
            let vector = parse_vector(values).unwrap_or_else(|e| make_error(&e));
            Request::Feed { stream, vector }
        }
        "step" => {
            let count = match args.get(1) {
                Some(n) => n
                    .parse()
                    .unwrap_or_else(|_| make_error("step count must be a number")),
                None => 1,
            };
            Request::Step { count }
        }
        "cycle" => {
            if args.len() < 2 {
                usage();
            }
            let secs: f64 = args[1]
                .parse()
                .unwrap_or_else(|_| make_error("cycle duration must be seconds, e.g. 12 or 0.6"));
            Request::SetCycleDuration { secs }
        }
        "trace" => Request::ExportTrace {
            path: args.get(1).cloned(),
        },
        "reset" => Request::Reset,
        "shutdown" => Request::Shutdown,
        _ => usage(),
    };

    match send_request(&addr, &req) {
        Ok(Response::State(s)) => print_state(s),
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
