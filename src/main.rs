// src/main.rs

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pkgd::backend::BackendEvent;
use pkgd::daemon::config::DEFAULT_CONFIG_PATH;
use pkgd::daemon::{DaemonLock, PkgdConfig, QueueEvent, ReadOnly, TransactionQueue};
use pkgd::role::UpgradeKind;
use pkgd::{
    Filter, FilterSet, Hints, Outcome, PackageId, Params, Role, SyncBridge, TransactionEvent,
    TransactionFlag, TransactionFlags,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pkgd")]
#[command(author, version, about = "Package transaction daemon", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Daemon {
        /// Refuse roles that modify the system
        #[arg(long)]
        read_only: bool,
    },
    /// List configured backends
    Backends,
    /// Run one transaction and print its events
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Role to run (e.g. search-name, refresh-cache)
    role: Role,
    /// Run on this backend instead of the first capable one
    #[arg(short, long)]
    backend: Option<String>,
    /// Query filter, repeatable (e.g. installed, ~devel)
    #[arg(short, long = "filter")]
    filters: Vec<Filter>,
    /// Transaction flag, repeatable (e.g. simulate)
    #[arg(long = "flag")]
    flags: Vec<TransactionFlag>,
    /// Package id (name;version;arch;origin), repeatable
    #[arg(short, long = "id")]
    ids: Vec<PackageId>,
    /// Search term, name, provide or file path, repeatable
    #[arg(short, long = "value")]
    values: Vec<String>,
    #[arg(long)]
    recursive: bool,
    #[arg(long)]
    allow_deps: bool,
    #[arg(long)]
    autoremove: bool,
    #[arg(long)]
    force: bool,
    /// Repository id for repo-enable / repo-remove
    #[arg(long)]
    repo: Option<String>,
    /// Enabled state for repo-enable
    #[arg(long)]
    enabled: Option<bool>,
    /// Destination for download-packages
    #[arg(long)]
    directory: Option<PathBuf>,
    /// Distribution id for upgrade-system
    #[arg(long)]
    distro: Option<String>,
    #[arg(long, default_value = "default")]
    upgrade_kind: UpgradeKind,
    /// Locale passed to the backend
    #[arg(long)]
    locale: Option<String>,
    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn to_params(&self) -> Params {
        let mut params = Params::new()
            .with_filters(self.filters.iter().copied().collect::<FilterSet>())
            .with_flags(self.flags.iter().copied().collect::<TransactionFlags>())
            .with_package_ids(self.ids.iter().cloned())
            .with_values(self.values.iter().cloned())
            .with_recursive(self.recursive)
            .with_allow_deps(self.allow_deps)
            .with_autoremove(self.autoremove)
            .with_force(self.force)
            .with_hints(Hints {
                locale: self.locale.clone(),
                interactive: false,
                background: false,
                cache_age: None,
            });
        if let Some(ref backend) = self.backend {
            params = params.with_backend(backend);
        }
        params.repo_id = self.repo.clone();
        params.enabled = self.enabled;
        params.directory = self.directory.clone();
        if let Some(ref distro) = self.distro {
            params = params.with_distro_upgrade(distro, self.upgrade_kind);
        }
        params
    }
}

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pkgd-engine")
        .build()
        .context("Failed to create async runtime")
}

fn load_config(path: &Path) -> Result<PkgdConfig> {
    PkgdConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn cmd_daemon(config_path: &Path, read_only: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let daemon_config = config.to_daemon_config();
    let registry = config.to_registry()?;

    let _lock = DaemonLock::try_acquire(&daemon_config.lock_path)?;
    info!("Starting pkgd version {}", env!("CARGO_PKG_VERSION"));
    info!("{} backends registered", registry.len());

    let grace = daemon_config.kill_grace * 2;
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let queue = TransactionQueue::new(registry, daemon_config)?;
        if read_only {
            info!("Read-only mode: modifying roles are refused");
            queue.set_privilege_check(ReadOnly);
        }

        let mut events = queue.watch();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(QueueEvent::Finished { id, outcome }) => {
                        info!("Transaction {} finished: {}", id, outcome)
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Dropped {} queue events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        info!("Daemon ready");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }

        queue.shutdown(grace).await;
        info!("Daemon shutting down");
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_backends(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = config.to_registry()?;

    if registry.is_empty() {
        println!("No backends configured in {}", config_path.display());
        return Ok(());
    }

    for backend in registry.iter() {
        let limit = match backend.max_concurrent {
            Some(n) => n.to_string(),
            None => "unlimited".to_string(),
        };
        println!("{}", backend.name);
        println!("  Command: {} {}", backend.command.display(), backend.args.join(" "));
        println!("  Concurrency: {}", limit);
        println!("  Filters: {}", backend.filters);
        let roles: Vec<&str> = backend.roles.iter().map(|r| r.as_str()).collect();
        println!("  Roles: {}", roles.join(", "));
    }
    Ok(())
}

fn print_event(event: &TransactionEvent) {
    match event {
        TransactionEvent::Backend(BackendEvent::Package {
            info,
            package_id,
            summary,
        }) => println!("{:<12} {:<40} {}", info.to_string(), package_id.as_str(), summary),
        TransactionEvent::Backend(BackendEvent::Percentage(Some(p))) => eprintln!("[{:>3}%]", p),
        TransactionEvent::Backend(BackendEvent::Status(status)) => eprintln!("Status: {}", status),
        TransactionEvent::Backend(BackendEvent::Message { kind, detail }) => {
            println!("{}: {}", kind, detail)
        }
        TransactionEvent::Backend(BackendEvent::Error { code, detail }) => {
            eprintln!("Error [{}]: {}", code, detail)
        }
        TransactionEvent::Backend(other) => match serde_json::to_string(other) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", other.keyword()),
        },
        TransactionEvent::StateChanged(_) | TransactionEvent::Finished(_) => {}
    }
}

fn cmd_run(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = config.to_registry()?;
    let runtime = build_runtime()?;

    let queue = TransactionQueue::with_handle(
        runtime.handle().clone(),
        registry,
        config.to_daemon_config(),
    );
    let bridge = SyncBridge::new(queue);
    let json = args.json;

    let (outcome, results) = bridge.run(args.role, args.to_params(), |event| {
        if json {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
        } else {
            print_event(event);
        }
    })?;

    runtime.shutdown_timeout(Duration::from_secs(1));

    match outcome {
        Outcome::Success => {
            if !json {
                eprintln!("Finished: {} packages", results.packages.len());
            }
            Ok(())
        }
        other => bail!("Transaction {}", other),
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Daemon { read_only }) => cmd_daemon(&cli.config, read_only),
        Some(Commands::Backends) => cmd_backends(&cli.config),
        Some(Commands::Run(args)) => cmd_run(&cli.config, args),
        None => {
            println!("pkgd v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'pkgd --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "pkgd",
            "--config",
            "/tmp/pkgd.toml",
            "run",
            "remove-packages",
            "--id",
            "foo;1.0;x86_64;repo",
            "--allow-deps",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/pkgd.toml"));
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.role, Role::RemovePackages);
        let params = args.to_params();
        assert_eq!(params.package_ids.len(), 1);
        assert!(params.allow_deps);
        assert!(!params.autoremove);
    }

    #[test]
    fn test_cli_parses_filters() {
        let cli = Cli::try_parse_from([
            "pkgd", "run", "search-name", "-f", "installed", "-f", "~devel", "-v", "vim",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        let params = args.to_params();
        assert_eq!(params.filters.to_string(), "installed;~devel");
        assert_eq!(params.values, vec!["vim".to_string()]);
    }

    #[test]
    fn test_cli_rejects_bad_id() {
        assert!(
            Cli::try_parse_from(["pkgd", "run", "get-details", "--id", "foo;1.0"]).is_err()
        );
    }
}
