use std::io::{self, Write as _};
use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{broadcast, oneshot};

use stm32_uart_flasher::linux::LinuxOpener;
use stm32_uart_flasher::manifest::parse_offset;
use stm32_uart_flasher::notify::{NotificationEvent, NotificationKind};
use stm32_uart_flasher::orchestrator::ids;
use stm32_uart_flasher::{
    Manifest, ManifestEntry, Notifier, Options, Orchestrator, OutputLog, OutputRecord, Settings,
};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: PathBuf,

    /// Serial port baud rate, overrides the saved setting
    #[structopt(long)]
    baud: Option<u32>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Connect and report the chip and MAC address
    Info,

    /// Erase the whole flash
    Erase {
        /// Do not ask for confirmation
        #[structopt(long)]
        yes: bool,
    },

    /// Write one or more binaries, as FILE or FILE@OFFSET (hex)
    Program {
        /// Do not ask for confirmation
        #[structopt(long)]
        yes: bool,

        #[structopt(required = true)]
        files: Vec<String>,
    },

    /// Show or change saved settings
    Settings {
        /// Baud rate to save
        #[structopt(long)]
        baud: Option<u32>,

        /// Restore defaults
        #[structopt(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Command::Settings { baud, reset } = &o.command {
        return settings(*baud, *reset);
    }

    let mut settings = Settings::load().unwrap_or_else(|e| {
        warn!("Could not load settings ({}), using defaults", e);
        Settings::default()
    });
    if let Some(baud) = o.baud {
        settings.set_baud_rate(baud)?;
    }

    match &o.command {
        Command::Erase { yes: false } => {
            if !confirm("Erase the entire flash?")? {
                bail!("Aborted");
            }
        }
        Command::Program { yes: false, files } => {
            if !confirm(&format!("Write {} file(s) to the device?", files.len()))? {
                bail!("Aborted");
            }
        }
        _ => (),
    }

    let log = OutputLog::default();
    let notifier = Notifier::new();
    let (stop_tx, stop_rx) = oneshot::channel();
    let renderer = tokio::spawn(render(log.subscribe(), notifier.subscribe(), stop_rx));

    let opener = LinuxOpener::new(o.port.clone(), o.options.clone());
    let orch = Orchestrator::new(opener, settings.session_config(), log, notifier);

    let res = run(&orch, &o.command).await;

    orch.disconnect().await;
    let _ = stop_tx.send(());
    let _ = renderer.await;

    res
}

async fn run(orch: &Orchestrator<LinuxOpener>, command: &Command) -> anyhow::Result<()> {
    let identity = orch.connect().await?;

    match command {
        Command::Info => {
            println!("Chip:        {}", identity.chip_name);
            println!("MAC address: {}", identity.mac);
            let offsets: Vec<_> = orch
                .default_manifest()
                .iter()
                .map(|e| format!("0x{}", e.offset()))
                .collect();
            println!("Offsets:     {}", offsets.join(", "));
        }
        Command::Erase { .. } => {
            orch.erase().await?;
        }
        Command::Program { files, .. } => {
            let manifest = build_manifest(files, &orch.default_manifest())?;
            let report = orch.program(&manifest).await?;

            for f in &report.failed {
                error!("{} (entry {}): {}", f.name, f.index, f.error);
            }
            if report.attempted == 0 {
                bail!("No files to program");
            }
            if !report.all_flashed() {
                bail!(
                    "{} of {} file(s) failed",
                    report.failed.len(),
                    report.attempted
                );
            }
        }
        Command::Settings { .. } => (),
    }

    Ok(())
}

/// Build a manifest from `FILE[@OFFSET]` arguments, taking missing offsets
/// from the chip defaults at the same position
fn build_manifest(files: &[String], defaults: &Manifest) -> anyhow::Result<Manifest> {
    let mut manifest = Manifest::new();

    for (i, arg) in files.iter().enumerate() {
        let (path, offset) = match split_offset(arg) {
            (path, Some(offset)) => (path, offset.to_string()),
            (path, None) => (
                path,
                defaults
                    .get(i)
                    .map(|e| e.offset().to_string())
                    .unwrap_or_else(|| "0".to_string()),
            ),
        };

        let meta = std::fs::metadata(path).with_context(|| format!("Cannot access {}", path))?;
        info!(
            "{} ({}) at offset 0x{}",
            path,
            bytefmt::format(meta.len()),
            offset
        );

        manifest.add(ManifestEntry::file(path, offset));
    }

    Ok(manifest)
}

/// Split `FILE@OFFSET`, only when the suffix is a valid hex offset
fn split_offset(arg: &str) -> (&str, Option<&str>) {
    match arg.rsplit_once('@') {
        Some((path, offset)) if !path.is_empty() && parse_offset(offset).is_ok() => {
            (path, Some(offset))
        }
        _ => (arg, None),
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;

    Ok(line.trim().eq_ignore_ascii_case("y"))
}

fn settings(baud: Option<u32>, reset: bool) -> anyhow::Result<()> {
    let path = Settings::path()?;
    let mut s = if reset {
        Settings::default()
    } else {
        Settings::load_from(&path)?
    };

    if let Some(baud) = baud {
        s.set_baud_rate(baud)?;
    }
    if reset || baud.is_some() {
        s.save_to(&path)?;
    }

    println!("Settings:  {}", path.display());
    println!("Baud rate: {}", s.baud_rate);

    Ok(())
}

fn print_record(bar: Option<&ProgressBar>, record: &OutputRecord) {
    let line = format!("[{}] {}", record.time.format("%H:%M:%S%.3f"), record.text);
    match bar {
        // The bar already shows write progress
        Some(_) if record.text.starts_with("Flashing...") => (),
        Some(bar) => bar.println(line),
        None => println!("{}", line),
    }
}

/// Print output log records and render the upload notification as a bar
/// until `stop` fires
async fn render(
    mut records: broadcast::Receiver<OutputRecord>,
    mut events: broadcast::Receiver<NotificationEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut bar: Option<ProgressBar> = None;

    loop {
        tokio::select! {
            biased;

            r = records.recv() => match r {
                Ok(record) => print_record(bar.as_ref(), &record),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Skipped {} log lines", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            e = events.recv() => match e {
                Ok(NotificationEvent::Shown(n)) if n.id == ids::UPLOAD => {
                    let b = bar.get_or_insert_with(|| {
                        let b = ProgressBar::new(100);
                        b.set_style(
                            ProgressStyle::default_bar()
                                .template("{msg:32} [{bar:40}] {percent:>3}%")
                                .progress_chars("=> "),
                        );
                        b
                    });
                    b.set_message(&n.text);
                    if let Some(p) = n.progress {
                        b.set_position((p * 100.0).round() as u64);
                    }
                }
                Ok(NotificationEvent::Dismissed(id)) if id == ids::UPLOAD => {
                    if let Some(b) = bar.take() {
                        b.finish_and_clear();
                    }
                }
                Ok(NotificationEvent::Shown(n)) => match n.kind {
                    NotificationKind::Error | NotificationKind::Warning => eprintln!("{}", n.text),
                    _ => debug!("{}", n.text),
                },
                Ok(NotificationEvent::Dismissed(_)) => (),
                Err(broadcast::error::RecvError::Lagged(_)) => (),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        }
    }

    // Flush whatever was logged before the stop request
    while let Ok(record) = records.try_recv() {
        print_record(bar.as_ref(), &record);
    }
    if let Some(b) = bar.take() {
        b.finish_and_clear();
    }
}
