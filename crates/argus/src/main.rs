//! Main application entry point for the Argus diagnostic platform.
//!
//! Provides CLI interface, configuration loading, and platform startup
//! with the built-in heartbeat plugins registered and any configured
//! bundles loaded from the config directory.

use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use argus_platform::{PipelineInfo, Platform, PlatformConfig, PluginInfo};

// ============================================================================
// Configuration
// ============================================================================

/// Application configuration loaded from TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Platform configuration
    pub platform: PlatformConfig,
    /// Logging configuration
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter
    pub level: String,
    /// JSON formatting
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        // Out of the box the platform hosts the heartbeat pair, so a
        // fresh install shows events flowing end to end.
        let mut platform = PlatformConfig::default();
        let mut source = PluginInfo::named("HeartbeatSource");
        source.event_source = true;
        source.pipelines = vec!["heartbeat".to_string()];
        platform.plugins = vec![source, PluginInfo::named("HeartbeatSink")];
        platform.pipelines = vec![PipelineInfo {
            name: "heartbeat".to_string(),
            plugins: vec!["HeartbeatSink".to_string()],
        }];

        Self {
            platform,
            logging: LoggingSettings { level: "info".to_string(), json_format: false },
        }
    }
}

impl AppConfig {
    /// Load configuration from file, writing the defaults on first run
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            ));
        }

        for (label, dir) in [
            ("config_dir", &self.platform.config_dir),
            ("work_dir", &self.platform.work_dir),
            ("persist_dir", &self.platform.persist_dir),
            ("cloud_update_dir", &self.platform.cloud_update_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(format!("Platform {label} cannot be empty"));
            }
        }

        if self.platform.check_idle_secs == 0 {
            return Err("check_idle_secs must be at least 1".to_string());
        }

        Ok(())
    }
}

// ============================================================================
// CLI Interface
// ============================================================================

/// Command line arguments
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse command line arguments
    pub fn parse() -> Self {
        let matches = Command::new("Argus Diagnostic Platform")
            .version(option_env!("CARGO_PKG_VERSION").unwrap_or("UNK"))
            .about("Plugin-hosting platform for always-on device diagnostics")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("argus.toml"),
            )
            .arg(
                Arg::new("work-dir")
                    .short('w')
                    .long("work-dir")
                    .value_name("DIR")
                    .help("Override the platform work directory"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("Default config path should always be set"),
            ),
            work_dir: matches.get_one::<String>("work-dir").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

// ============================================================================
// Logging Setup
// ============================================================================

/// Initialize logging system
fn setup_logging(config: &LoggingSettings) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

// ============================================================================
// Signal Handling
// ============================================================================

/// Setup graceful shutdown signal handling
async fn setup_signal_handlers() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Application
// ============================================================================

pub struct Application {
    config: AppConfig,
    platform: Arc<Platform>,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        // Apply CLI overrides
        if let Some(work_dir) = args.work_dir {
            config.platform.work_dir = work_dir;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {}", e).into());
        }

        setup_logging(&config.logging)?;
        display_banner();

        // Built-in factories must exist before their declarations are
        // resolved.
        plugin_heartbeat::register_builtin_factories();
        let platform = Platform::init(config.platform.clone())?;

        info!(
            "📂 Config: {} | Work dir: {}",
            args.config_path.display(),
            config.platform.work_dir.display()
        );

        Ok(Self { config, platform })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let stats = self.platform.stats();
        info!("📋 Configuration Summary:");
        info!("  🔌 Plugins hosted: {}", stats.plugins);
        info!("  🔗 Pipelines: {}", stats.pipelines);
        info!("  🧵 Private loops: {}", stats.private_loops);
        info!("  💤 Proxy idle eviction: {}s", self.config.platform.max_idle_secs);

        // Periodic health reporting
        let monitoring_handle = {
            let platform = self.platform.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    let stats = platform.stats();
                    info!(
                        "📊 Platform health - {} plugins | {} pipelines | {} queued broadcasts | {} listeners",
                        stats.plugins, stats.pipelines, stats.queue_depth, stats.listeners
                    );
                }
            })
        };

        info!("✅ Argus platform is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        setup_signal_handlers().await?;

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        monitoring_handle.abort();
        self.platform.shutdown();

        let report = self.platform.dump(&[]);
        for line in report.lines() {
            info!("  {}", line);
        }
        info!("👋 Argus platform shutdown complete");

        Ok(())
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Utilities and Helpers
// ============================================================================

/// Display startup banner using proper logging
fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║            🔎 ARGUS PLATFORM 🔎          ║");
    info!("║              version {}               ║", version);
    info!("║                                          ║");
    info!("║  Always-on device diagnostics            ║");
    info!("║  with a hosted plugin architecture       ║");
    info!("║                                          ║");
    info!("║  📨 Broadcast + pipeline events          ║");
    info!("║  🔌 Lazy proxy plugins                   ║");
    info!("║  📦 Runtime loadable bundles             ║");
    info!("╚══════════════════════════════════════════╝");
}

// ============================================================================
// Tests
// ============================================================================
