//! Headless runner for gamerun guests.
//!
//! Loads a guest module, wires it to a [`HostSystem`] with headless sinks and
//! drives it until the guest shuts down or the process is interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use gamerun::Driver;
use gamerun::Game;
use gamerun::GameConfig;
use gamerun::HostSystem;
use gamerun::IoHandler;
use gamerun::IoRequest;
use gamerun::Workspace;
use gamerun::config::StateBackend;
use gamerun::system::FileStore;
use gamerun::system::MemoryStore;
use gamerun::system::StateStore;
use tracing_subscriber::EnvFilter;
use wasmtime::Engine;

#[derive(Parser)]
#[command(name = "gamerun")]
#[command(author, version, about = "Run a WebAssembly game or editor headlessly", long_about = None)]
struct Cli {
    /// Guest module (.wasm or .wat); overrides the config file
    module: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persist guest state in this directory instead of memory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Window width announced to the guest
    #[arg(long)]
    width: Option<u32>,

    /// Window height announced to the guest
    #[arg(long)]
    height: Option<u32>,

    /// Workspace PNG to load after initialization
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Directory receiving saved workspaces
    #[arg(long, default_value = ".")]
    save_dir: PathBuf,

    /// Enable verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Serves I/O requests without a user interface.
struct HeadlessIo {
    save_dir: PathBuf,
}

impl IoHandler<HostSystem> for HeadlessIo {
    type Error = anyhow::Error;

    fn handle(&mut self, request: IoRequest, workspace: &mut Workspace<'_, HostSystem>) -> Result<()> {
        match request {
            IoRequest::SaveWorkspace => {
                let png = workspace.workspace_png()?;
                let stamp = SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let path = self.save_dir.join(format!("workspace-{}.png", stamp));
                std::fs::write(&path, png).with_context(|| format!("writing {}", path.display()))?;
                tracing::info!(path = %path.display(), "workspace saved");
            }
            IoRequest::Vibrate => tracing::info!("vibrate"),
            IoRequest::InputNumber { id } => {
                tracing::warn!(id, "number input requested; no input available in headless mode")
            }
            other => tracing::warn!(request = ?other, "request needs a file picker; ignored in headless mode"),
        }
        Ok(())
    }

    fn notify_dirty(&mut self) {
        tracing::info!("workspace has unsaved changes");
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn,guest=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<GameConfig> {
    let mut config = match &cli.config {
        Some(path) => GameConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => GameConfig::default(),
    };
    if let Some(module) = &cli.module {
        config.module = Some(module.clone());
    }
    if let Some(dir) = &cli.state_dir {
        config.state = StateBackend::Directory(dir.clone());
    }
    if let Some(width) = cli.width {
        config.window.width = width;
    }
    if let Some(height) = cli.height {
        config.window.height = height;
    }
    Ok(config)
}

async fn open_store(backend: &StateBackend) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match backend {
        StateBackend::Memory => Arc::new(MemoryStore::new()),
        StateBackend::Directory(dir) => Arc::new(
            FileStore::open(dir)
                .await
                .with_context(|| format!("opening state directory {}", dir.display()))?,
        ),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let module = config
        .module
        .clone()
        .context("no guest module given (pass a path or set \"module\" in the config)")?;

    let (host, events) = HostSystem::builder()
        .window(config.window)
        .store(open_store(&config.state).await?)
        .build();

    let engine = Engine::default();
    let mut game = Game::from_file(&engine, &module, &config)
        .with_context(|| format!("loading {}", module.display()))?;
    game.initialize(&host).context("guest initialization failed")?;
    tracing::info!(module = %module.display(), "guest initialized");

    let handler = HeadlessIo { save_dir: cli.save_dir.clone() };
    let mut driver = Driver::new(game, host, events, handler);
    if config.disable_save_workspace_button {
        driver.workspace().disable_save_workspace_button()?;
    }
    if let Some(path) = &cli.workspace {
        let png = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        driver.set_workspace(&png)?;
    }
    let mut driver = driver.dirty_notification(config.dirty_notification)?;

    tokio::select! {
        result = driver.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    let stats = driver.game().buffer_stats();
    tracing::debug!(obtained = stats.obtained, freed = stats.freed, live = stats.live, "buffer balance");
    Ok(())
}
