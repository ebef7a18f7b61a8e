//! nanogl entrypoint: build the device stack against a real or mock pipe,
//! stream a demo job through the interpreter, and mirror the pipe's
//! observability signals to the console.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use core_codec::describe_status;
use core_config::DeviceConfig;
use core_events::{Signal, SignalBus};
use core_interp::{Interpreter, LaserCommand, RealtimeCommand};
use core_pipe::{Controller, Pipe};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "nanogl", version, about = "LhyMicro-GL driver console")]
struct Args {
    /// Job to stream through the interpreter.
    #[arg(value_enum, default_value_t = Job::Status)]
    job: Job,
    /// Configuration file path (overrides discovery of `nanogl.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run against the mock pipe regardless of configuration.
    #[arg(long)]
    mock: bool,
    /// Also write a debug-level log file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Job {
    /// Query and print the device status.
    Status,
    /// Home the rail.
    Home,
    /// Cut a 1000-step square at moderate power.
    Square,
    /// Raster two scanline rows.
    Raster,
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

fn describe(topic: &str, signal: &Signal) -> String {
    match signal {
        Signal::Buffer(len) => format!("{topic}: {len} bytes pending"),
        Signal::Packet(bytes) => format!("{topic}: {} bytes", bytes.len()),
        Signal::PacketText(bytes) => {
            format!("{topic}: {}", String::from_utf8_lossy(bytes).trim_end())
        }
        Signal::Status(words) => {
            format!("{topic}: {words:?} ({})", describe_status(words[1]))
        }
        Signal::UsbState(code) => format!("{topic}: {code}"),
        Signal::UsbStatus(name) => format!("{topic}: {name}"),
        Signal::ChipVersion(version) => format!("{topic}: {version:#x}"),
        Signal::Thread(state) => format!("{topic}: {state}"),
        Signal::Wait { status, attempt } => {
            format!("{topic}: {} (attempt {attempt})", describe_status(*status))
        }
        Signal::Error(refusals) => format!("{topic}: {refusals} refusals"),
        Signal::Position { x, y, .. } => format!("{topic}: ({x}, {y})"),
        Signal::Mode(code) => format!("{topic}: mode {code}"),
        Signal::Plot { x, y, on } => format!("{topic}: ({x}, {y}) on={on}"),
        Signal::Text(text) => format!("{topic}: {text}"),
    }
}

/// Mirror the observability topics onto a channel drained by a printer
/// thread, so listeners never block the pipe.
fn attach_monitor(bus: &SignalBus) -> thread::JoinHandle<()> {
    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    for topic in [
        "pipe;thread",
        "pipe;status",
        "pipe;usb_status",
        "pipe;packet_text",
        "pipe;error",
        "interpreter;mode",
        "interpreter;status",
    ] {
        let tx = tx.clone();
        bus.listen(topic, move |signal| {
            let _ = tx.send(describe(topic, signal));
        });
    }
    thread::spawn(move || {
        while let Ok(line) = rx.recv() {
            println!("{line}");
        }
    })
}

fn job_commands(job: Job) -> Vec<LaserCommand> {
    match job {
        Job::Status => vec![LaserCommand::Status],
        Job::Home => vec![LaserCommand::Home],
        Job::Square => vec![
            LaserCommand::Home,
            LaserCommand::SetSpeed(30.0),
            LaserCommand::SetPower(500.0),
            LaserCommand::ModeCompactSet,
            LaserCommand::Cut { x: 1000, y: 0 },
            LaserCommand::Cut { x: 1000, y: 1000 },
            LaserCommand::Cut { x: 0, y: 1000 },
            LaserCommand::Cut { x: 0, y: 0 },
            LaserCommand::ModeDefault,
            LaserCommand::Home,
        ],
        Job::Raster => {
            let runs = vec![(0, 0, 1), (400, 0, 1), (400, 2, 1), (0, 2, 1)];
            vec![
                LaserCommand::Home,
                LaserCommand::SetSpeed(120.0),
                LaserCommand::SetPower(800.0),
                LaserCommand::SetStep(2),
                LaserCommand::ModeCompactSet,
                LaserCommand::Raster(runs),
                LaserCommand::ModeDefault,
                LaserCommand::Home,
            ]
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_file.as_ref())?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("nanogl.toml"));
    let mut config = DeviceConfig::load_from(&config_path)?;
    if args.mock {
        config.mock = true;
    }

    let bus = SignalBus::new();
    let monitor = attach_monitor(&bus);
    let controller = Controller::new(&config, bus.clone());
    let mut interpreter = Interpreter::new(controller.clone(), bus.clone(), &config)
        .context("unsupported board in configuration")?;

    controller.start();
    info!(job = ?args.job, board = %config.board, mock = config.mock, "streaming job");

    for command in job_commands(args.job) {
        // The hold gate covers explicit waits and pipe backpressure.
        while interpreter.hold() {
            thread::sleep(Duration::from_millis(50));
        }
        interpreter.command(command);
    }
    interpreter.realtime_command(RealtimeCommand::Status);

    // Trailing wait-finished directive, then let the sender drain and stop.
    controller.write(b"-\n");
    controller.finish();
    controller.join();

    let (x, y) = interpreter.position();
    info!(
        packets = controller.packet_count(),
        rejected = controller.rejected_count(),
        position = ?(x, y),
        "job complete"
    );
    // The monitor thread is detached; it dies with the process.
    drop(monitor);
    Ok(())
}
