use anyhow::{Context, Result};
use clap::Parser;
use probeweave::{
    aggregator::{ProfileLog, SortKey},
    cli::{Cli, Command, OutputFormat},
    clock::ManualClock,
    config::{EngineConfig, MAX_TARGET_ENTRIES, MIN_TARGET_ENTRIES},
    engine::Engine,
    registry::TargetDescriptor,
    session::{self, CollectionConfig, SessionHeader, SessionStore},
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Site names used by `simulate`, in order
const SIMULATED_SITES: [&str; 6] = [
    "Pawn.Tick",
    "Map.Render",
    "Path.Find",
    "Job.Haul",
    "Room.Update",
    "Sound.Play",
];

/// Initialize tracing subscriber; `--debug` raises the level to TRACE
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_toml(path),
        None => Ok(EngineConfig::default()),
    }
}

fn print_header(path: &Path, header: &SessionHeader, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(header)?);
        }
        OutputFormat::Text => {
            println!("=== Session {} ===", path.display());
            println!("Name:                     {}", header.display_name());
            println!("Target:                   {}", header.target_name);
            println!("Version:                  {}", header.version);
            println!(
                "Entries:                  {}/{}",
                header.entries, header.target_entries
            );
            println!("Entry per call:           {}", header.entry_per_call);
            println!(
                "Only entries with values: {}",
                header.only_entries_with_values
            );
        }
    }
    Ok(())
}

fn inspect(path: &Path, format: OutputFormat) -> Result<()> {
    let header = session::store::read_header_at(path);
    if !header.is_valid() {
        anyhow::bail!("{}: not a valid session file", path.display());
    }
    print_header(path, &header, format)
}

fn list(store: &SessionStore, target: &str, format: OutputFormat) -> Result<()> {
    let headers = store
        .headers_for(target)
        .with_context(|| format!("Failed to list sessions in {}", store.dir().display()))?;

    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = headers
                .iter()
                .map(|(path, header)| {
                    serde_json::json!({
                        "path": path,
                        "valid": header.is_valid(),
                        "header": header,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            if headers.is_empty() {
                println!("No sessions for '{}' in {}", target, store.dir().display());
            }
            for (path, header) in &headers {
                if header.is_valid() {
                    println!(
                        "{}  {}  {}/{}",
                        path.display(),
                        header.display_name(),
                        header.entries,
                        header.target_entries
                    );
                } else {
                    println!("{}  <corrupt>", path.display());
                }
            }
        }
    }
    Ok(())
}

fn compare(lhs: &Path, rhs: &Path, format: OutputFormat) -> Result<()> {
    let left = session::store::load_session(lhs)
        .with_context(|| format!("Failed to load {}", lhs.display()))?;
    let right = session::store::load_session(rhs)
        .with_context(|| format!("Failed to load {}", rhs.display()))?;
    let report = session::DeltaReport::compare(&left, &right);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", report.to_report_string()),
    }
    Ok(())
}

fn print_logs(logs: &[ProfileLog], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(logs)?),
        OutputFormat::Text => {
            println!(
                "{:<24} {:>10} {:>10} {:>10} {:>12} {:>8} {:>8}",
                "Label", "Mean(ms)", "Median", "Max", "Total", "Calls", "%"
            );
            println!("{}", "-".repeat(88));
            for log in logs {
                println!(
                    "{:<24} {:>10.4} {:>10.4} {:>10.4} {:>12.4} {:>8} {:>8.2}",
                    log.label, log.mean, log.median, log.max, log.total, log.calls, log.percent
                );
            }
        }
    }
    Ok(())
}

struct Simulation {
    cycles: u32,
    targets: usize,
    sort: SortKey,
    seed: Option<u64>,
    save: bool,
    label: Option<String>,
}

/// Run a synthetic workload on a manual clock so results are reproducible
fn simulate(config: EngineConfig, sim: Simulation, format: OutputFormat) -> Result<()> {
    let seed = sim.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    tracing::info!("Simulating {} cycles (seed {})", sim.cycles, seed);

    let clock = Arc::new(ManualClock::new());
    let target_entries = config
        .default_target_entries
        .clamp(MIN_TARGET_ENTRIES, MAX_TARGET_ENTRIES);
    let engine = Engine::with_clock(config, clock.clone());

    let mut sites = Vec::with_capacity(sim.targets);
    for i in 0..sim.targets {
        let name = SIMULATED_SITES
            .get(i)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("Site.Call{}", i));
        let site = engine
            .weaver()
            .weave(TargetDescriptor::<()>::parse(&name))
            .with_context(|| format!("Failed to instrument {}", name))?;
        let base_ms = 0.5 * (i + 1) as f64;
        sites.push((site, base_ms));
    }

    let collection = match (sim.save, sites.first()) {
        (true, Some((site, _))) => {
            let config = CollectionConfig {
                target_entries,
                custom_name: sim.label.clone(),
                ..CollectionConfig::default()
            };
            Some(engine.start_collection(site.slot(), &config)?)
        }
        _ => None,
    };

    for _ in 0..sim.cycles {
        for (site, base_ms) in &sites {
            for _ in 0..rng.gen_range(0..=3u32) {
                let cost = base_ms * rng.gen_range(0.8f64..1.2);
                site.call(|| clock.advance(Duration::from_secs_f64(cost / 1000.0)));
            }
        }
        engine.end_cycle();
    }
    engine.aggregator().run_cycle();

    print_logs(&engine.get_ranked_logs(sim.sort), format)?;

    if let Some(handle) = collection {
        let path = engine
            .save_session(&handle)
            .context("Failed to save simulated session")?;
        eprintln!("Saved session ({}) to {}", handle.status(), path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Inspect { file } => inspect(&file, args.format)?,
        Command::List { target, dir } => {
            let store = SessionStore::new(dir.unwrap_or_else(|| config.session_dir.clone()));
            list(&store, &target, args.format)?;
        }
        Command::Compare { lhs, rhs } => compare(&lhs, &rhs, args.format)?,
        Command::Simulate {
            cycles,
            targets,
            sort,
            seed,
            save,
            label,
        } => {
            let sim = Simulation {
                cycles,
                targets,
                sort,
                seed,
                save,
                label,
            };
            simulate(config, sim, args.format)?;
        }
    }

    Ok(())
}
