use clap::{Parser, Subcommand};
use ipstack::capture::AfPacketSocket;
use ipstack::config::{self, Config};
use ipstack::stack::{DetachedInterfaces, EthernetInterfaces, Stack};
use ipstack::telemetry::{init_logging, MetricsRegistry};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const METRICS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "ipstack")]
#[command(about = "User-space IPv4/IPv6 network layer with routing, NAT and ARP/ND")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Bind the configured devices and run until Ctrl-C
    Run {
        /// Path to config.toml or config.lock
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Show the route chosen for an address
    Route {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        address: IpAddr,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { action } => {
            init_logging(None);
            match action {
                ConfigAction::Generate { config, output } => cmd_config_generate(&config, &output),
                ConfigAction::Validate { config } => cmd_config_validate(&config),
            }
        }
        Commands::Run { config } => cmd_run(&config),
        Commands::Route { config, address } => {
            init_logging(None);
            cmd_route(&config, address)
        }
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

/// Load and validate, printing diagnostics.
fn load_valid(path: &Path) -> Result<Config, String> {
    let cfg = config::load(path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }
    Ok(cfg)
}

fn cmd_run(path: &Path) -> Result<(), String> {
    let cfg = config::load(path).map_err(|e| format!("Failed to parse config: {}", e))?;
    init_logging(Some(&cfg.logging));

    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        tracing::warn!("{}", warning);
    }
    if validation.has_errors() {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err("Validation failed with errors".to_string());
    }

    info!("Loaded {}", path.display());

    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let metrics = Arc::new(MetricsRegistry::new());

        let mut interfaces = EthernetInterfaces::new(
            |name: &str| {
                info!("Binding to interface {}...", name);
                let socket = AfPacketSocket::bind(name)?;
                let mac = socket.mac();
                Ok((socket, mac))
            },
            cfg.resolver,
            metrics.clone(),
        );
        let stack = Stack::build(&cfg, &mut interfaces, metrics.clone())
            .map_err(|e| format!("Failed to start: {}. Run with root privileges.", e))?;

        info!("ipstack running, Ctrl-C to stop");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);

        loop {
            tokio::select! {
                res = &mut shutdown => {
                    if let Err(e) = res {
                        error!("Failed to wait for Ctrl-C: {}", e);
                    }
                    break;
                }
                _ = ticker.tick() => {
                    for (name, value) in metrics.export() {
                        debug!(metric = %name, value, "metrics");
                    }
                }
            }
        }

        info!("Shutting down");
        stack.close();
        Ok(())
    })
}

fn cmd_route(path: &Path, address: IpAddr) -> Result<(), String> {
    let cfg = load_valid(path)?;
    let stack = Stack::build(
        &cfg,
        &mut DetachedInterfaces::default(),
        Arc::new(MetricsRegistry::new()),
    )
    .map_err(|e| format!("Failed to build routing table: {}", e))?;

    match stack.describe_route(address) {
        Some(route) => println!("{}", route),
        None => println!("{}: no route", address),
    }
    Ok(())
}

fn cmd_config_generate(config_path: &Path, output_path: &Path) -> Result<(), String> {
    println!("[INFO] Loading {}...", config_path.display());

    let cfg = load_valid(config_path)?;
    let lock = config::generate_lock(&cfg);

    let lock_toml =
        toml::to_string_pretty(&lock).map_err(|e| format!("Failed to serialize lock: {}", e))?;

    let output = format!(
        "# Generated by ipstack - DO NOT EDIT\n# Source: {}\n\n{}",
        config_path.display(),
        lock_toml
    );

    std::fs::write(output_path, output).map_err(|e| format!("Failed to write lock file: {}", e))?;

    println!("[INFO] Generated {}", output_path.display());
    Ok(())
}

fn cmd_config_validate(config_path: &Path) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    load_valid(config_path)?;
    println!("[INFO] Configuration is valid");
    Ok(())
}
