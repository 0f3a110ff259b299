use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, warn};

use atomclay::agent::{AgentClient, AgentConfig};
use atomclay::api::{self, AppState, ServerOptions};
use atomclay::logs::LogStreamConfig;
use atomclay::workspace::{WorkspaceConfig, WorkspaceManager};

const APP_NAME: &str = "atomclay";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_workspace(ctx: RuntimeContext, cmd: WorkspaceCommand) -> Result<()> {
    handle_workspace(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Workspace { command } => async_workspace(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "AtomClay - workspace and streaming relay for the agentom agent.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Maintain the shared workspace
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Base URL of the agent server
    #[arg(long = "upstream-url", env = "AGENTOM_BASE_URL", value_name = "URL")]
    upstream_url: Option<String>,
    /// Project root holding the workspace and the JSON settings file
    #[arg(long, value_name = "PATH")]
    project_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum WorkspaceCommand {
    /// Archive outputs and clear the workspace
    Cleanup,
    /// Archive outputs without clearing anything else
    Archive,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level().to_string().to_lowercase();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::TRACE
        } else if self.common.debug {
            LevelFilter::DEBUG
        } else if self.common.quiet {
            LevelFilter::ERROR
        } else {
            match self.common.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            }
        }
    }

    fn workspace_config(&self, project_root: Option<PathBuf>) -> Result<WorkspaceConfig> {
        let cfg = &self.config.workspace;
        let project_root = match project_root {
            Some(path) => expand_path(path)?,
            None => expand_str_path(&cfg.project_root)?,
        };
        let project_root = std::path::absolute(&project_root)
            .with_context(|| format!("resolving project root {}", project_root.display()))?;

        Ok(WorkspaceConfig {
            root: project_root.join(expand_str_path(&cfg.root)?),
            archive_config: project_root.join(expand_str_path(&cfg.archive_config)?),
            project_root,
        })
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    workspace: PathsConfig,
    upstream: UpstreamConfig,
    logs: LogsConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: Vec::new(),
        }
    }
}

/// Workspace locations. Relative paths resolve against `project_root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    project_root: String,
    root: String,
    archive_config: String,
    /// Archive and clear the workspace when the server stops.
    cleanup_on_shutdown: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_root: ".".to_string(),
            root: "workspace".to_string(),
            archive_config: "config/config.json".to_string(),
            cleanup_on_shutdown: true,
        }
    }
}

/// Agent server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct UpstreamConfig {
    base_url: String,
    app_name: String,
    session_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        let agent = AgentConfig::default();
        Self {
            base_url: agent.base_url,
            app_name: agent.app_name,
            session_timeout_secs: agent.session_timeout.as_secs(),
        }
    }
}

/// Log streaming timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LogsConfig {
    wait_timeout_ms: u64,
    poll_interval_ms: u64,
    keepalive_secs: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5000,
            poll_interval_ms: 100,
            keepalive_secs: 15,
        }
    }
}

impl LogsConfig {
    fn stream_config(&self) -> LogStreamConfig {
        LogStreamConfig {
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_workspace(ctx: &RuntimeContext, cmd: WorkspaceCommand) -> Result<()> {
    let workspace = WorkspaceManager::new(ctx.workspace_config(None)?);

    if ctx.common.dry_run {
        info!(
            "dry-run: would {:?} workspace at {}",
            cmd,
            workspace.root().display()
        );
        return Ok(());
    }

    let report = match cmd {
        WorkspaceCommand::Cleanup => {
            let report = workspace.cleanup().await.context("cleaning workspace")?;
            serde_json::to_value(&report)?
        }
        WorkspaceCommand::Archive => {
            let report = workspace.archive().await.context("archiving outputs")?;
            serde_json::to_value(&report)?
        }
    };

    if ctx.common.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", toml::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting AtomClay middleware...");

    let workspace = WorkspaceManager::new(ctx.workspace_config(cmd.project_root)?);
    workspace
        .ensure_dirs()
        .await
        .context("preparing workspace directories")?;
    info!("Workspace: {}", workspace.root().display());

    let upstream = &ctx.config.upstream;
    let base_url = cmd.upstream_url.unwrap_or_else(|| upstream.base_url.clone());
    info!("Agent server: {}", base_url);
    let agent = AgentClient::new(AgentConfig {
        base_url,
        app_name: upstream.app_name.clone(),
        session_timeout: Duration::from_secs(upstream.session_timeout_secs),
    })
    .context("creating agent client")?;

    let options = ServerOptions {
        cors_origins: ctx.config.server.cors_origins.clone(),
        keepalive: Duration::from_secs(ctx.config.logs.keepalive_secs.max(1)),
        logs: ctx.config.logs.stream_config(),
    };

    let shutdown = CancellationToken::new();
    let state = AppState::new(workspace, agent, options, shutdown.clone());
    let workspace = state.workspace.clone();
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("running server")?;

    if ctx.config.workspace.cleanup_on_shutdown {
        info!("Cleaning up workspace before exit...");
        if let Err(e) = workspace.cleanup().await {
            warn!("Workspace cleanup failed during shutdown: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM, ending open log streams first.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, closing log streams...");
    token.cancel();
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 3000_i64)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix.as_str())
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display())
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, 3000);
        assert_eq!(parsed.upstream.base_url, "http://localhost:8000");
        assert_eq!(parsed.upstream.app_name, "agentom");
        assert!(parsed.workspace.cleanup_on_shutdown);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let parsed: AppConfig = toml::from_str("[logs]\nwait_timeout_ms = 250\n").unwrap();
        assert_eq!(parsed.logs.wait_timeout_ms, 250);
        assert_eq!(parsed.logs.poll_interval_ms, 100);
        assert_eq!(parsed.workspace.root, "workspace");
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "ATOMCLAY");
    }

    #[test]
    fn test_cli_parses_serve_overrides() {
        let cli = Cli::try_parse_from([
            "atomclay",
            "serve",
            "--port",
            "4000",
            "--upstream-url",
            "http://agent:9000",
        ])
        .unwrap();
        match cli.command {
            Command::Serve(cmd) => {
                assert_eq!(cmd.port, Some(4000));
                assert_eq!(cmd.upstream_url.as_deref(), Some("http://agent:9000"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
