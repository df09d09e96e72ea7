//! Editor Heartbeat CLI
//!
//! Debounces editor activity into heartbeats and delivers them to a
//! time-tracking service.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use editor_heartbeat::{
    activity::{ActivityEvent, LineSource},
    config::Config,
    core::{ActivityRecorder, Debouncer},
    dispatch::{Dispatcher, DispatcherOptions, FlushOutcome},
    plugin_id,
    queue::{HeartbeatQueue, QueueStore},
    status::{DeliveryStats, SharedStatus, StatusReporter},
    transmit::{CliTransmitter, Transmitter},
    Settings, VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "editor-heartbeat")]
#[command(version = VERSION)]
#[command(about = "Heartbeat debouncing and delivery for editor time tracking", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Values that take precedence over the configuration file.
#[derive(Args, Debug, Clone, Default)]
struct Overrides {
    /// API key for the tracking service
    #[arg(long)]
    key: Option<String>,

    /// Tracking service endpoint
    #[arg(long)]
    api_url: Option<String>,

    /// Seconds between heartbeats for the same file
    #[arg(long)]
    interval: Option<u64>,

    /// Heartbeat CLI binary
    #[arg(long)]
    cli_path: Option<PathBuf>,

    /// Editor name and version, e.g. "helix/24.03"
    #[arg(long)]
    editor: Option<String>,

    /// Deliver over HTTP instead of through the heartbeat CLI
    #[arg(long)]
    http: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(ref key) = self.key {
            config.settings.api_key = Some(key.clone());
        }
        if let Some(ref api_url) = self.api_url {
            config.settings.api_url = Some(api_url.clone());
        }
        if let Some(interval) = self.interval {
            config.settings.heartbeat_interval = interval;
        }
        if let Some(ref cli_path) = self.cli_path {
            config.cli_path = cli_path.clone();
        }
        if let Some(ref editor) = self.editor {
            config.plugin = plugin_id(editor);
        }
        if self.debug {
            config.settings.debug = true;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Record activity from stdin (or HTTP) and deliver heartbeats until stopped
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Accept activity over HTTP on 127.0.0.1 instead of stdin
        #[cfg(feature = "server")]
        #[arg(long)]
        listen: Option<u16>,
    },

    /// Deliver pending heartbeats once and exit
    Flush {
        #[command(flatten)]
        overrides: Overrides,

        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show delivery status and statistics
    Status,

    /// Show configuration
    Config,
}

fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);

    let result = match cli.command {
        #[cfg(feature = "server")]
        Commands::Run { overrides, listen } => cmd_run(&config_path, overrides, listen),
        #[cfg(not(feature = "server"))]
        Commands::Run { overrides } => cmd_run(&config_path, overrides, None),
        Commands::Flush { overrides, timeout } => {
            cmd_flush(&config_path, overrides, Duration::from_secs(timeout))
        }
        Commands::Status => cmd_status(&config_path),
        Commands::Config => cmd_config(&config_path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// Install the tracing subscriber; logs go to stderr so stdout stays clean.
fn init_tracing(debug: bool) {
    let default = if debug {
        "editor_heartbeat=debug"
    } else {
        "editor_heartbeat=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: &Path, overrides: &Overrides) -> anyhow::Result<Config> {
    let mut config = Config::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn build_transmitter(config: &Config, http: bool) -> anyhow::Result<Arc<dyn Transmitter>> {
    if http {
        #[cfg(feature = "http")]
        {
            let transmitter = editor_heartbeat::transmit::HttpTransmitter::new(&config.plugin)?;
            return Ok(Arc::new(transmitter));
        }
        #[cfg(not(feature = "http"))]
        anyhow::bail!("--http requires the `http` feature");
    }
    Ok(Arc::new(CliTransmitter::new(
        config.cli_path.clone(),
        config.plugin.clone(),
    )))
}

fn cmd_run(config_path: &Path, overrides: Overrides, listen: Option<u16>) -> anyhow::Result<()> {
    let config = load_config(config_path, &overrides)?;
    init_tracing(config.settings.debug);
    config.ensure_directories()?;

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(run_agent(config_path.to_path_buf(), config, overrides, listen))
}

async fn run_agent(
    config_path: PathBuf,
    config: Config,
    overrides: Overrides,
    listen: Option<u16>,
) -> anyhow::Result<()> {
    let run_id = uuid::Uuid::new_v4();
    tracing::info!(%run_id, version = VERSION, data = %config.data_path.display(), "agent starting");

    let queue = Arc::new(HeartbeatQueue::open(&config.queue_path(), config.queue_soft_cap)?);
    let stats = Arc::new(DeliveryStats::with_persistence(config.stats_path()));
    let status = Arc::new(SharedStatus::with_persistence(config.status_path()));
    let transmitter = build_transmitter(&config, overrides.http)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (settings_tx, settings_rx) = watch::channel(config.settings.clone());

    let dispatcher = Dispatcher::new(
        queue.clone(),
        transmitter,
        status.clone(),
        stats.clone(),
        config.settings.clone(),
        DispatcherOptions::from(&config),
    );
    let dispatch_task = tokio::spawn(dispatcher.run(shutdown_rx, settings_rx));

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")?;

    // Activity source: HTTP when listening, stdin otherwise
    let mut stdin_source = None;
    #[cfg(feature = "server")]
    let mut server_shutdown = None;

    let receiver: Receiver<ActivityEvent> = match listen {
        #[cfg(feature = "server")]
        Some(port) => {
            use editor_heartbeat::server::{run, ServerConfig, ServerState};

            let (sender, receiver) = crossbeam_channel::bounded(10_000);
            let state = ServerState::new(sender, status.clone(), stats.clone(), queue.clone());
            let (addr, shutdown) = run(ServerConfig::new(port), state).await?;
            println!("Listening for activity on http://{addr}");
            server_shutdown = Some(shutdown);
            receiver
        }
        _ => {
            let mut source = LineSource::stdin();
            source.start()?;
            let receiver = source.receiver().clone();
            stdin_source = Some(source);
            receiver
        }
    };

    let recorder = ActivityRecorder::new(
        Debouncer::new(
            config.settings.heartbeat_interval,
            config.debounce_idle_window.as_secs(),
        ),
        queue.clone(),
        stats.clone(),
    );

    let producer = ProducerLoop {
        receiver,
        recorder,
        running,
        config_path,
        overrides,
        config_poll: config.config_poll,
        settings: config.settings.clone(),
        settings_tx,
    };
    tokio::task::spawn_blocking(move || producer.run())
        .await
        .context("producer loop panicked")?;

    // Stop intake, then let the dispatcher make its final flush
    if let Some(mut source) = stdin_source {
        source.stop();
    }
    #[cfg(feature = "server")]
    if let Some(shutdown) = server_shutdown {
        let _ = shutdown.send(());
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatch_task.await {
        tracing::error!("dispatcher task failed: {e}");
    }

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save statistics: {e}");
    }

    println!();
    println!("{}", status.current());
    println!("{}", stats.summary());
    Ok(())
}

/// Feeds activity through the recorder on a blocking thread and turns
/// config file changes into explicit reloads.
struct ProducerLoop {
    receiver: Receiver<ActivityEvent>,
    recorder: ActivityRecorder,
    running: Arc<AtomicBool>,
    config_path: PathBuf,
    overrides: Overrides,
    config_poll: Duration,
    settings: Settings,
    settings_tx: watch::Sender<Settings>,
}

impl ProducerLoop {
    fn run(mut self) {
        let mut last_config_check = Instant::now();
        let mut last_modified = modified_time(&self.config_path);

        while self.running.load(Ordering::SeqCst) {
            if last_config_check.elapsed() >= self.config_poll {
                let modified = modified_time(&self.config_path);
                if modified != last_modified {
                    last_modified = modified;
                    self.reload();
                }
                last_config_check = Instant::now();
            }

            match self.receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    self.recorder.record(&event);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("activity input closed");
                    break;
                }
            }
        }
    }

    fn reload(&mut self) {
        match load_config(&self.config_path, &self.overrides) {
            Ok(config) => {
                if config.settings == self.settings {
                    return;
                }
                self.recorder
                    .set_interval(config.settings.heartbeat_interval);
                self.settings = config.settings.clone();
                if self.settings_tx.send(config.settings).is_err() {
                    tracing::warn!("dispatcher is gone, settings reload dropped");
                }
            }
            Err(e) => tracing::warn!("ignoring unreadable configuration change: {e:#}"),
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn cmd_flush(config_path: &Path, overrides: Overrides, timeout: Duration) -> anyhow::Result<()> {
    let config = load_config(config_path, &overrides)?;
    init_tracing(config.settings.debug);
    config.ensure_directories()?;

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(flush_once(config, overrides, timeout))
}

async fn flush_once(config: Config, overrides: Overrides, timeout: Duration) -> anyhow::Result<()> {
    let queue = Arc::new(HeartbeatQueue::open(&config.queue_path(), config.queue_soft_cap)?);
    let stats = Arc::new(DeliveryStats::with_persistence(config.stats_path()));
    let status = Arc::new(SharedStatus::with_persistence(config.status_path()));

    println!("Pending heartbeats: {}", queue.len());
    if queue.is_empty() {
        return Ok(());
    }

    let mut dispatcher = Dispatcher::new(
        queue.clone(),
        build_transmitter(&config, overrides.http)?,
        status.clone(),
        stats.clone(),
        config.settings.clone(),
        DispatcherOptions::from(&config),
    );

    match tokio::time::timeout(timeout, dispatcher.flush()).await {
        Ok(report) => {
            println!("Sent: {}", report.sent);
            if report.rejected > 0 {
                println!("Rejected as malformed: {}", report.rejected);
            }
            match report.outcome {
                FlushOutcome::Empty => println!("Queue drained."),
                FlushOutcome::AuthHalted => eprintln!("Authentication failed; check the API key."),
                FlushOutcome::Retrying { .. } | FlushOutcome::Waiting { .. } => {
                    eprintln!("Delivery failed; heartbeats kept for the next attempt.")
                }
                FlushOutcome::Delivered { .. } => {}
            }
        }
        Err(_) => eprintln!("Flush timed out after {}s", timeout.as_secs()),
    }

    let mut current = status.current();
    current.pending = queue.len();
    status.report(&current);
    queue.sync()?;
    stats.save()?;
    println!("{current}");
    Ok(())
}

fn cmd_status(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_from(config_path).unwrap_or_default();

    println!("Editor Heartbeat Status");
    println!("=======================");
    println!();

    println!("Configuration:");
    println!("  API url: {}", config.settings.api_url());
    println!(
        "  API key: {}",
        if config.settings.api_key().is_some() {
            "configured"
        } else {
            "missing"
        }
    );
    println!("  Heartbeat interval: {}s", config.settings.heartbeat_interval);
    println!("  Heartbeat CLI: {}", config.cli_path.display());
    println!();

    match SharedStatus::load_file(&config.status_path()) {
        Ok(status) => println!("Delivery: {status}"),
        Err(_) => println!("Delivery: no status recorded yet"),
    }

    // read-only, so this works while an agent holds the journal
    let replay = QueueStore::inspect(&config.queue_path())?;
    println!("Pending heartbeats: {}", replay.pending.len());
    println!();

    let stats_path = config.stats_path();
    if stats_path.exists() {
        let stats = DeliveryStats::with_persistence(stats_path);
        println!("Cumulative {}", stats.summary());
    } else {
        println!("No previous session data found.");
    }
    Ok(())
}

fn cmd_config(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_from(config_path)?;

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {}", config_path.display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
