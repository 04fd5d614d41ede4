//! `ppc1ctl`: command-line front end for the PPC1.
//!
//! ```bash
//! ppc1ctl ports
//! ppc1ctl monitor --count 20
//! ppc1ctl set channel D 190
//! ppc1ctl set droplet 80
//! ppc1ctl run demos/protocol.toml --simulate
//! ```
//!
//! During `run`, pressing Enter acknowledges an ask step and Ctrl-C cancels
//! the protocol (the safety pump-off still runs).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ppc1_control::config::{Ppc1Config, DEFAULT_CONFIG_PATH};
use ppc1_control::error::AppResult;
use ppc1_control::experiment::{Protocol, ProtocolRunner, RunSummary, RunnerEvent, RunnerState};
use ppc1_control::fluidics::{FlowStatus, Solution, WellTracker};
use ppc1_control::hardware::{
    list_ports, Channel, DeviceSnapshot, Ppc1Controller, Ppc1Device, SimulatedPpc1, Valve,
};
use ppc1_control::logging::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ppc1ctl")]
#[command(about = "Control a Fluicell PPC1 pump controller", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overrides the configuration
    #[arg(long)]
    port: Option<String>,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports and mark PPC1 devices
    Ports,

    /// Stream telemetry, flow estimates and well volumes
    Monitor {
        /// Stop after this many frames
        #[arg(long)]
        count: Option<usize>,

        /// Solution being delivered (1-4), for the flow estimate
        #[arg(long)]
        solution: Option<u8>,
    },

    /// Send a single command
    Set {
        #[command(subcommand)]
        target: SetTarget,
    },

    /// Execute a protocol file (.toml or .json)
    Run {
        protocol: PathBuf,

        /// Dry run on the simulator
        #[arg(long)]
        simulate: bool,

        /// Write the run summary as JSON
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Reboot the device
    Reboot,
}

#[derive(Subcommand)]
enum SetTarget {
    /// Channel set point in mbar (A/recirc, B/switch, C/poff, D/pon)
    Channel {
        channel: Channel,
        #[arg(allow_hyphen_values = true)]
        mbar: f64,
    },
    /// Open or close one valve (i, j, k, l)
    Valve {
        valve: Valve,
        #[arg(value_parser = parse_open)]
        state: bool,
    },
    /// Packed valve mask in hex, bit set = closed
    Valves {
        #[arg(value_parser = parse_hex_mask)]
        mask: u8,
    },
    /// Droplet size in percent
    Droplet { percent: f64 },
    /// Flow speed in percent
    Flow { percent: f64 },
    /// Recirculation vacuum in percent
    Vacuum { percent: f64 },
    /// Zero every set point and close every valve
    Off,
}

fn parse_open(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "open" | "1" | "on" => Ok(true),
        "close" | "closed" | "0" | "off" => Ok(false),
        other => Err(format!("expected open or close, got '{other}'")),
    }
}

fn parse_hex_mask(s: &str) -> Result<u8, String> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Ppc1Config::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.serial.port = port;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Ports => show_ports(),
        Commands::Monitor { count, solution } => monitor(&config, count, solution).await,
        Commands::Set { target } => set(&config, target).await,
        Commands::Run {
            protocol,
            simulate,
            record,
        } => run_protocol(&config, protocol, simulate, record).await,
        Commands::Reboot => reboot(&config).await,
    }
}

fn show_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{vid:04X}:{pid:04X}"),
            _ => "----:----".to_string(),
        };
        let marker = if port.is_ppc1 { "  <- PPC1" } else { "" };
        println!(
            "{:<20} {ids}  {}{marker}",
            port.name,
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn connect(config: &Ppc1Config) -> Result<Arc<Ppc1Controller>> {
    let ppc1 = Arc::new(Ppc1Controller::new(config));
    ppc1.connect(&config.serial.port)
        .await
        .with_context(|| format!("Failed to connect to {}", config.serial.port))?;
    Ok(ppc1)
}

async fn shutdown(ppc1: &Ppc1Controller) {
    if let Some(fault) = ppc1.check_fault().await {
        warn!(fault = %fault, "PPC1 was faulted");
        return;
    }
    if ppc1.is_running() {
        if let Err(e) = ppc1.stop().await {
            warn!(error = %e, "Stop failed");
        }
    }
    if ppc1.is_connected() {
        if let Err(e) = ppc1.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }
    }
}

async fn monitor(config: &Ppc1Config, count: Option<usize>, solution: Option<u8>) -> Result<()> {
    let active = match solution {
        Some(slot) => Some(Solution::from_slot(slot).context("solution must be 1-4")?),
        None => None,
    };

    let ppc1 = connect(config).await?;
    ppc1.set_active_solution(active).await;
    ppc1.run().await.context("Failed to start telemetry")?;
    if let Err(e) = ppc1.request_temperature().await {
        warn!(error = %e, "Temperature request failed");
    }

    let mut snapshots = ppc1.subscribe_snapshots();
    let mut states = ppc1.subscribe_state();
    let mut wells = WellTracker::new(config.wells);
    let mut last_tick = Instant::now();
    let mut frames = 0usize;

    let outcome = loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let Some(snapshot) = snapshot else { continue };

                let flows = ppc1.flow_status().await;
                wells.tick(&flows, last_tick.elapsed());
                last_tick = Instant::now();
                print_snapshot(&snapshot, &flows, &wells);

                frames += 1;
                if count.is_some_and(|limit| frames >= limit) {
                    break Ok(());
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                if let Some(fault) = ppc1.fault() {
                    break Err(anyhow::anyhow!("PPC1 fault: {fault}"));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
        }
    };

    info!(
        frames,
        decode_failures = ppc1.decode_failures(),
        "Monitor finished"
    );
    shutdown(&ppc1).await;
    outcome
}

fn print_snapshot(snapshot: &DeviceSnapshot, flows: &FlowStatus, wells: &WellTracker) {
    let channels: Vec<String> = Channel::ALL
        .iter()
        .map(|c| {
            let state = snapshot.channel(*c);
            format!("{c} {:>8.2}/{:>8.2}", state.sensor_reading, state.set_point)
        })
        .collect();
    let valves: String = Valve::ALL
        .iter()
        .map(|v| if snapshot.valves.is_open(*v) { '1' } else { '0' })
        .collect();
    let temperature = snapshot
        .temperature
        .map(|t| format!(" {t:.1}C"))
        .unwrap_or_default();

    println!(
        "{} | valves {valves} | in {} out {} | outflow {:.3} nL/s{temperature}",
        channels.join(" | "),
        u8::from(snapshot.sync.input),
        u8::from(snapshot.sync.output),
        flows.outflow_total,
    );
    if !wells.depleted().is_empty() {
        println!("  depleted solution wells: {:?}", wells.depleted());
    }
    if wells.waste_warning() {
        println!("  waste wells nearly full: {:?} uL", wells.waste_volume());
    }
}

async fn set(config: &Ppc1Config, target: SetTarget) -> Result<()> {
    let ppc1 = connect(config).await?;
    let result = apply(ppc1.as_ref(), target).await;
    shutdown(&ppc1).await;
    result.context("Command rejected")
}

async fn apply(device: &dyn Ppc1Device, target: SetTarget) -> AppResult<()> {
    match target {
        SetTarget::Channel { channel, mbar } => device.set_channel(channel, mbar).await,
        SetTarget::Valve { valve, state } => device.set_valve(valve, state).await,
        SetTarget::Valves { mask } => device.set_valves_state(mask).await,
        SetTarget::Droplet { percent } => device.set_droplet_size(percent).await,
        SetTarget::Flow { percent } => device.set_flow_speed(percent).await,
        SetTarget::Vacuum { percent } => device.set_vacuum_percentage(percent).await,
        SetTarget::Off => device.pumping_off().await,
    }
}

async fn reboot(config: &Ppc1Config) -> Result<()> {
    let ppc1 = connect(config).await?;
    let result = ppc1.reboot().await;
    shutdown(&ppc1).await;
    result.context("Reboot failed")
}

async fn run_protocol(
    config: &Ppc1Config,
    path: PathBuf,
    simulate: bool,
    record: Option<PathBuf>,
) -> Result<()> {
    let protocol = Protocol::load(&path)
        .with_context(|| format!("Failed to load protocol {}", path.display()))?;
    let expansion = protocol.expand()?;
    println!(
        "{}: {} commands, {} steps, {:.1} s of waits",
        protocol.name,
        protocol.len(),
        expansion.steps,
        expansion.wait.as_secs_f64()
    );

    let simulator = Arc::new(SimulatedPpc1::new(config.defaults, config.limits));
    let physical = if simulate || config.runner.simulation {
        None
    } else {
        let ppc1 = connect(config).await?;
        ppc1.run().await.context("Failed to start telemetry")?;
        Some(ppc1)
    };

    let device = physical
        .clone()
        .map(|ppc1| ppc1 as Arc<dyn Ppc1Device>);
    let runner = Arc::new(ProtocolRunner::new(device, simulator, &config.runner));
    let mut events = runner.subscribe();
    runner.start(protocol)?;

    let acknowledger = Arc::clone(&runner);
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if acknowledger.state() == RunnerState::AwaitingAck {
                if let Err(e) = acknowledger.acknowledge() {
                    warn!(error = %e, "Acknowledge failed");
                }
            }
        }
    });

    let finished = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RunnerEvent::Finished(summary)) => break Some(summary),
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped runner events"),
                Err(RecvError::Closed) => break None,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling protocol");
                if let Err(e) = runner.cancel() {
                    warn!(error = %e, "Cancel failed");
                }
            }
        }
    };

    let summary = runner.join().await.or(finished);
    stdin_task.abort();
    if let Some(ppc1) = &physical {
        shutdown(ppc1).await;
    }

    let summary = summary.context("Protocol task ended without a summary")?;
    report(&summary, record)?;
    if summary.state == RunnerState::Faulted {
        bail!(
            "Protocol faulted: {}",
            summary.error.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn print_event(event: &RunnerEvent) {
    match event {
        RunnerEvent::StateChanged(state) => println!("[{state}]"),
        RunnerEvent::StepStarted { index, instruction } => println!("#{index:<3} {instruction}"),
        RunnerEvent::Progress(progress) => {
            if !progress.remaining_step.is_zero() {
                print!(
                    "\r     {:5.1}%  step {:>5.1} s  total {:>6.1} s ",
                    progress.percent,
                    progress.remaining_step.as_secs_f64(),
                    progress.remaining_total.as_secs_f64()
                );
                if progress.remaining_step.as_millis() < 100 {
                    println!();
                }
            }
        }
        RunnerEvent::Ask { index, text } => println!("#{index:<3} ? {text}  (press Enter)"),
        RunnerEvent::Status(text) => println!("     {text}"),
        RunnerEvent::CommandRejected { index, reason } => {
            println!("#{index:<3} rejected: {reason}");
        }
        RunnerEvent::Fault(reason) => println!("FAULT: {reason}"),
        RunnerEvent::Finished(_) => {}
    }
}

fn report(summary: &RunSummary, record: Option<PathBuf>) -> Result<()> {
    println!(
        "{} after {} steps ({} rejected)",
        summary.state, summary.steps_executed, summary.steps_rejected
    );
    if let Some(path) = record {
        summary
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Run summary written");
    }
    Ok(())
}
