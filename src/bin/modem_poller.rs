use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use modem_poller::config::{load_config, PollerConfig};
use modem_poller::export::CommandExporter;
use modem_poller::parser::ServingCellParser;
use modem_poller::query::QueryEngine;
use modem_poller::scheduler::{PollScheduler, ScheduleSettings};
use modem_poller::store::TelemetryStore;
use modem_poller::telemetry::{Sample, TechnologyTag};
use modem_poller::transport::{LineTransport, SerialTransport};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("modem-poller")
        .version("0.1.0")
        .author("Modem Telemetry Team")
        .about("📶 Cellular modem serving-cell poller")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("PATH")
                .help("Modem AT port (overrides config)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("baud")
                .short("b")
                .long("baud")
                .value_name("RATE")
                .help("Serial baud rate (overrides config)")
                .takes_value(true)
                .global(true)
                .validator(|v| match v.parse::<u32>() {
                    Ok(rate) if rate > 0 => Ok(()),
                    _ => Err("Baud rate must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("snapshot")
                .short("s")
                .long("snapshot")
                .value_name("FILE")
                .help("Snapshot file (overrides config)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("🛰️  Poll the modem until interrupted")
                .long_about("Polls the serving cell every tick, keeps a bounded history and snapshots it periodically")
                .arg(
                    Arg::with_name("export")
                        .short("e")
                        .long("export")
                        .value_name("COMMAND")
                        .help("Command run with the snapshot path after each snapshot (overrides config)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("every")
                        .long("every")
                        .value_name("TICKS")
                        .help("Trim and snapshot every N ticks (overrides config)")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(n) if n > 0 => Ok(()),
                            _ => Err("Tick count must be a positive number".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("query")
                .about("📡 Query the serving cell once and print it"),
        )
        .subcommand(
            SubCommand::with_name("inspect")
                .about("📊 Summarize a snapshot file"),
        )
        .get_matches();

    init_tracing(matches.is_present("verbose"));

    let mut config = load_config(matches.value_of("config").map(Path::new))?;
    apply_overrides(&mut config, &matches);
    config.validate()?;

    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("query", _) => handle_query(&config, format)?,
        ("inspect", _) => handle_inspect(&config, format)?,
        ("run", Some(sub_matches)) => {
            apply_run_overrides(&mut config, sub_matches);
            config.validate()?;
            handle_run(config).await?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start polling", "modem-poller run".bright_cyan());
            println!("  {} One-shot serving cell query", "modem-poller query".bright_cyan());
            println!("  {} Summarize recorded history", "modem-poller inspect".bright_cyan());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(config: &mut PollerConfig, matches: &ArgMatches<'_>) {
    if let Some(device) = matches.value_of("device") {
        config.device = device.to_string();
    }
    if let Some(baud) = matches.value_of("baud").and_then(|v| v.parse().ok()) {
        config.baud_rate = baud;
    }
    if let Some(snapshot) = matches.value_of("snapshot") {
        config.snapshot_path = PathBuf::from(snapshot);
    }
}

fn apply_run_overrides(config: &mut PollerConfig, matches: &ArgMatches<'_>) {
    if let Some(export) = matches.value_of("export") {
        config.export_command = Some(export.split_whitespace().map(str::to_string).collect());
    }
    if let Some(every) = matches.value_of("every").and_then(|v| v.parse().ok()) {
        config.maintenance_every_ticks = every;
    }
}

/// Open the port and discard whatever the modem buffered before we attached.
fn open_engine(config: &PollerConfig) -> Result<QueryEngine<SerialTransport>, Box<dyn std::error::Error>> {
    let mut transport = SerialTransport::open(&config.device, config.baud_rate, config.read_timeout())?;

    match transport.drain_stale(config.read_timeout()) {
        Ok(drained) => info!(drained, "stale input drained"),
        Err(e) => warn!(error = %e, "could not drain stale input"),
    }

    let mut engine = QueryEngine::new(transport, config.read_timeout())
        .with_max_read_attempts(config.max_read_attempts);
    if let Err(e) = engine.probe() {
        warn!(error = %e, "modem did not acknowledge AT, continuing");
    }
    Ok(engine)
}

async fn handle_run(config: PollerConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "📶 Modem Poller".bright_blue().bold());
    println!("   {} {} @ {} baud", "Device:".dimmed(), config.device, config.baud_rate);
    println!("   {} {}", "Snapshot:".dimmed(), config.snapshot_path.display());

    let engine = open_engine(&config)?;
    let store = TelemetryStore::restore(&config.snapshot_path, config.retention());

    let settings = ScheduleSettings::new(
        config.tick_interval(),
        config.maintenance_every_ticks,
        config.snapshot_path.clone(),
        config.serving_cell_command.clone(),
    )?;

    let mut scheduler = PollScheduler::new(engine, store, settings);
    if let Some(argv) = &config.export_command {
        let exporter = CommandExporter::from_argv(argv)?;
        info!(program = exporter.program(), "export enabled");
        scheduler = scheduler.with_exporter(Box::new(exporter));
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl+C, running until killed");
            std::future::pending::<()>().await;
        }
    };

    let scheduler = scheduler.run(shutdown).await?;
    let stats = scheduler.stats();
    println!(
        "{} {} ticks, {} failed queries, {} snapshots",
        "🛑 Poller stopped:".bright_yellow(),
        stats.total_ticks,
        stats.failed_queries,
        stats.snapshots_written
    );

    Ok(())
}

fn handle_query(config: &PollerConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = open_engine(config)?;
    let lines = engine.query(&config.serving_cell_command)?;

    let parser = ServingCellParser::new().with_echo(config.serving_cell_command.clone());
    let mut sample = Sample::new(chrono::Utc::now());
    sample.merge(parser.parse_serving_cell(&lines));

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&sample)?),
        "compact" => println!("{}", compact_line(&sample)),
        _ => print_sample_table(&sample),
    }
    Ok(())
}

fn handle_inspect(config: &PollerConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let samples = TelemetryStore::load(&config.snapshot_path)?;

    let count_with = |tag: TechnologyTag| samples.iter().filter(|s| s.reading(tag).is_some()).count();
    let lte = count_with(TechnologyTag::Lte);
    let nr = count_with(TechnologyTag::Nr);
    let empty = samples.iter().filter(|s| s.is_empty()).count();
    let first = samples.iter().map(|s| s.timestamp).min();
    let last = samples.iter().map(|s| s.timestamp).max();

    match format {
        "json" => {
            let summary = serde_json::json!({
                "path": config.snapshot_path.display().to_string(),
                "samples": samples.len(),
                "with_lte": lte,
                "with_nr": nr,
                "empty": empty,
                "first": first,
                "last": last,
                "latest": samples.last(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "compact" => {
            println!(
                "{} samples ({} LTE, {} NR, {} empty)",
                samples.len(),
                lte,
                nr,
                empty
            );
        }
        _ => {
            println!("{} {}", "📊".bright_blue(), "Snapshot Summary".bright_blue().bold());
            println!("{} {}", "File:".bright_white(), config.snapshot_path.display());
            println!("{} {}", "Samples:".bright_white(), samples.len());
            println!("{} {}", "With LTE:".bright_white(), lte);
            println!("{} {}", "With NR:".bright_white(), nr);
            println!("{} {}", "No readings:".bright_white(), empty.to_string().yellow());
            if let (Some(first), Some(last)) = (first, last) {
                println!("{} {} → {}", "Span:".bright_white(), first.to_rfc3339(), last.to_rfc3339());
            }
            if let Some(latest) = samples.last() {
                println!();
                print_sample_table(latest);
            }
        }
    }
    Ok(())
}

fn print_sample_table(sample: &Sample) {
    println!("{} {}", "Timestamp:".bright_white(), sample.timestamp.to_rfc3339());
    if sample.is_empty() {
        println!("{}", "No serving cell readings".yellow());
        return;
    }
    for (tag, record) in &sample.readings {
        println!("{}", format!("[{}]", tag).bright_cyan().bold());
        for (field, value) in record.fields() {
            println!("  {} {}", format!("{:<14}", field).dimmed(), value);
        }
    }
}

fn compact_line(sample: &Sample) -> String {
    if sample.is_empty() {
        return "no service".to_string();
    }
    sample
        .readings
        .iter()
        .map(|(tag, record)| {
            format!(
                "{} rsrp={} rsrq={} sinr={} band={}",
                tag,
                record.get("rsrp").unwrap_or("-"),
                record.get("rsrq").unwrap_or("-"),
                record.get("sinr").unwrap_or("-"),
                record.get("band").unwrap_or("-"),
            )
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
