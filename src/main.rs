use std::process;

use echobeats::clock::SyncPolicy;
use echobeats::config::EngineConfig;
use echobeats::engine::CognitiveEngine;
use echobeats::error::EchoError;
use echobeats::events::EngineEvent;
use echobeats::observer::EngineAdapter;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        None | Some("demo") => run_demo(),
        Some("trace") => match args.get(2) {
            Some(out) => run_trace(out, parse_steps(args.get(3), 36)),
            None => usage(),
        },
        Some("run") => match args.get(2) {
            Some(path) => run_config(path, parse_steps(args.get(3), 120)),
            None => usage(),
        },
        Some("--help" | "-h" | "help") => {
            print_help();
            return;
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            usage();
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn print_help() {
    println!("echobeats - 12-step cognitive cycle over three reservoir streams");
    println!();
    println!("Usage: echobeats [command]");
    println!();
    println!("Commands:");
    println!("  demo                       Simulate 10 cycles and print a summary (default)");
    println!("  trace <out.json> [steps]   Run and write a chrome://tracing profile");
    println!("  run <config.json> [steps]  Run with a JSON engine config");
    println!();
    println!("Set RUST_LOG=debug for per-step logging.");
}

fn usage() -> ! {
    print_help();
    process::exit(2);
}

fn parse_steps(arg: Option<&String>, default: usize) -> usize {
    match arg {
        Some(s) => s.parse().unwrap_or_else(|_| {
            eprintln!("steps must be a number");
            process::exit(2);
        }),
        None => default,
    }
}

/// Sinusoidal sensory drive, one vector per stream.
fn sensory_input(t: usize, stream: usize, len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| 0.8 * (0.37 * i as f64 + 0.2 * t as f64 + stream as f64).sin())
        .collect()
}

fn run_demo() -> Result<(), EchoError> {
    let cfg = EngineConfig::default().with_sync_policy(SyncPolicy::TriadClosure);
    let units = cfg.streams.first().map(|s| s.reservoir.units).unwrap_or(64);
    let builder = CognitiveEngine::builder(cfg);
    let events = builder.subscribe(8192);
    let mut engine = builder.build()?;

    for t in 0..120 {
        if t % 3 == 0 {
            engine.process_input(None, sensory_input(t, 0, units))?;
        }
        engine.tick()?;
    }

    let mut syncs = [0usize; 4];
    let mut quality = 0.0;
    let mut realized = 0;
    let mut mode_changes = 0;
    for event in events.drain() {
        match event {
            EngineEvent::TriadicSync {
                triad_index, quality: q, ..
            } => {
                if let Some(n) = syncs.get_mut(triad_index as usize) {
                    *n += 1;
                }
                quality += q;
            }
            EngineEvent::RelevanceRealized { .. } => realized += 1,
            EngineEvent::ModeChanged { .. } => mode_changes += 1,
            _ => {}
        }
    }
    let total: usize = syncs.iter().sum();

    let snap = EngineAdapter::new(&engine).snapshot();
    println!(
        "cycles={} step={} mode={:?} mode_changes={}",
        snap.cycle, snap.step, snap.step_config.mode, mode_changes
    );
    println!(
        "syncs={} per_triad={:?} mean_quality={:.3} relevance_realized={}",
        total,
        syncs,
        if total > 0 { quality / total as f64 } else { 0.0 },
        realized
    );
    println!("aggregate_coherence={:.3}", snap.aggregate_coherence);
    for s in &snap.streams {
        println!(
            "  {:<12} phase={:>2} activation={:.3} coherence={:.3} attention={:.3}",
            s.name, s.current_phase, s.activation_level, s.coherence, s.attention
        );
    }
    println!(
        "executor: completed={} steals={} utilization={:.1}% avg_latency={:.0}us",
        snap.executor.completed,
        snap.executor.steals,
        snap.executor.utilization * 100.0,
        snap.executor.avg_latency_us
    );
    Ok(())
}

fn run_trace(out: &str, steps: usize) -> Result<(), EchoError> {
    let mut engine = CognitiveEngine::new(EngineConfig::default().with_profiling(true))?;
    engine.run_steps(steps)?;
    engine.export_trace(out)?;

    for d in EngineAdapter::new(&engine).profile().domains {
        println!(
            "{:<20} count={:<5} avg={:.0}us peak={}us share={:.1}%",
            d.domain.as_str(),
            d.count,
            d.avg_us,
            d.peak_us,
            d.share * 100.0
        );
    }
    println!("trace written to {out}");
    Ok(())
}

fn run_config(path: &str, steps: usize) -> Result<(), EchoError> {
    let cfg = EngineConfig::load(path)?;
    let mut engine = CognitiveEngine::new(cfg)?;
    engine.run_steps(steps)?;

    let snap = EngineAdapter::new(&engine).snapshot();
    match serde_json::to_string_pretty(&snap) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("snapshot: {e}"),
    }
    Ok(())
}
