use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info};
use serde::{Deserialize, Serialize};

use termbay::container::{ContainerRuntime, ContainerRuntimeApi, RuntimeType};
use termbay::db::Database;
use termbay::events::{EventHub, SessionEvent};
use termbay::ports::PortRange;
use termbay::session::{
    CreateSessionRequest, HttpTerminalProbe, InMemorySessionStore, ReadinessConfig, Session,
    SessionFilter, SessionService, SessionServiceConfig, SessionStatus, SessionStore,
    SqliteSessionStore, TerminalMode,
};
use termbay::settings::FileSettings;
use termbay::watcher::WatcherConfig;

const APP_NAME: &str = "termbay";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: AsyncCommand) -> Result<()> {
    match command {
        AsyncCommand::Ping => handle_ping(&ctx).await,
        AsyncCommand::Session(command) => handle_session(&ctx, command).await,
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Ping => async_main(ctx, AsyncCommand::Ping),
        Command::Session { command } => async_main(ctx, AsyncCommand::Session(command)),
        Command::Completions { shell } => handle_completions(shell),
    }
}

enum AsyncCommand {
    Ping,
    Session(SessionCommand),
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Termbay - ephemeral containerized development sessions.",
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
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
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
    /// Create the default configuration file
    Init(InitCommand),
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Check that the container runtime answers
    Ping,
    /// Manage sessions
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
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
enum SessionCommand {
    /// Create a session and wait until it runs
    Create(CreateCommand),
    /// List sessions
    List {
        /// Only sessions in this status
        #[arg(long)]
        status: Option<SessionStatus>,
    },
    /// Show a session and its container
    Info { id: String },
    /// Stop a running session
    Stop { id: String },
    /// Start a stopped session
    Start { id: String },
    /// Recreate a session from its configuration
    Restart { id: String },
    /// Delete a stopped or failed session
    Delete { id: String },
    /// Probe the session's terminal endpoints
    Health { id: String },
    /// Show the repository status inside the session
    GitStatus { id: String },
    /// Commit all changes and push the current branch
    Commit {
        id: String,
        /// Commit message
        #[arg(short, long)]
        message: String,
    },
    /// Follow status and repository events until interrupted
    Watch,
}

#[derive(Debug, Clone, Args)]
struct CreateCommand {
    /// Display name
    #[arg(long)]
    name: String,
    /// Repository to clone into the session
    #[arg(long = "repo")]
    repo_url: String,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    git_user_name: Option<String>,
    #[arg(long)]
    git_user_email: Option<String>,
    /// Read an SSH private key for the session from this file
    #[arg(long, value_name = "PATH")]
    ssh_key_file: Option<PathBuf>,
    /// Expose only the primary terminal
    #[arg(long)]
    single: bool,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
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

        // Library code logs through the `log` facade.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&self.config.logging.level),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    /// Print `value` as JSON/YAML when requested, otherwise the human form.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            print!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            println!("{}", human());
        }
        Ok(())
    }

    fn runtime(&self) -> ContainerRuntime {
        let cfg = &self.config.container;
        match (cfg.runtime, cfg.binary.as_deref()) {
            (Some(kind), Some(binary)) => ContainerRuntime::with_binary(kind, binary),
            (Some(kind), None) => ContainerRuntime::with_type(kind),
            (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::Docker, binary),
            (None, None) => ContainerRuntime::new(),
        }
    }

    fn service_config(&self) -> Result<SessionServiceConfig> {
        let cfg = &self.config;
        Ok(SessionServiceConfig {
            image: cfg.container.image.clone(),
            port_range: PortRange::new(cfg.ports.start, cfg.ports.end)?,
            max_sessions: cfg.sessions.max_sessions,
            stop_grace_seconds: cfg.container.stop_grace_seconds,
            readiness: ReadinessConfig {
                poll_interval: Duration::from_millis(cfg.readiness.poll_interval_ms),
                max_attempts: cfg.readiness.max_attempts,
                probe_timeout: Duration::from_millis(cfg.readiness.probe_timeout_ms),
                probe_host: cfg.readiness.probe_host.clone(),
            },
            watcher: WatcherConfig {
                repo_path: cfg.sessions.repo_path.clone(),
                repo_wait_attempts: cfg.watcher.repo_wait_attempts,
                repo_wait_interval: Duration::from_millis(cfg.watcher.repo_wait_interval_ms),
                debounce: Duration::from_millis(cfg.watcher.debounce_ms),
            },
            stale_start_after: Duration::from_secs(cfg.sessions.stale_start_secs),
        })
    }

    async fn store(&self) -> Result<Arc<dyn SessionStore>> {
        match self.config.sessions.store {
            StoreBackend::Memory => Ok(Arc::new(InMemorySessionStore::new())),
            StoreBackend::Sqlite => {
                let path = match self.config.sessions.database {
                    Some(ref path) => expand_str_path(path)?,
                    None => self.paths.state_dir.join("sessions.db"),
                };
                let db = Database::new(&path).await?;
                Ok(Arc::new(SqliteSessionStore::new(db.pool().clone())))
            }
        }
    }

    fn settings_file(&self) -> Result<PathBuf> {
        match self.config.settings_file {
            Some(ref path) => expand_str_path(path),
            None => Ok(self
                .paths
                .config_file
                .parent()
                .map(|dir| dir.join("settings.toml"))
                .unwrap_or_else(|| PathBuf::from("settings.toml"))),
        }
    }

    async fn session_service(&self, events: Arc<EventHub>) -> Result<SessionService> {
        let config = self.service_config()?;
        let probe = HttpTerminalProbe::new(&config.readiness)?;
        let service = SessionService::new(
            config,
            Arc::new(self.runtime()),
            self.store().await?,
            Arc::new(FileSettings::new(self.settings_file()?)),
            events,
            Arc::new(probe),
        );
        service.restore_allocations().await?;
        Ok(service)
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
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

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    /// TOML file with global secrets and git identity
    settings_file: Option<String>,
    logging: LoggingConfig,
    paths: PathsConfig,
    container: ContainerRuntimeConfig,
    ports: PortsConfig,
    sessions: SessionsConfig,
    readiness: ReadinessSection,
    watcher: WatcherSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerRuntimeConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    binary: Option<String>,
    /// Image for session containers
    image: String,
    /// Seconds to wait before killing a stopping container
    stop_grace_seconds: u32,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: SessionServiceConfig::default().image,
            stop_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PortsConfig {
    start: u16,
    end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 7681,
            end: 7780,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoreBackend {
    /// Records live only as long as the process.
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionsConfig {
    max_sessions: usize,
    /// Repository checkout inside session containers
    repo_path: String,
    store: StoreBackend,
    /// SQLite database path (defaults to the state directory)
    database: Option<String>,
    /// Seconds before an unfinished creation is failed at startup
    stale_start_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: SessionService::DEFAULT_MAX_SESSIONS,
            repo_path: WatcherConfig::default().repo_path,
            store: StoreBackend::Sqlite,
            database: None,
            stale_start_secs: SessionServiceConfig::default().stale_start_after.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ReadinessSection {
    poll_interval_ms: u64,
    max_attempts: u32,
    probe_timeout_ms: u64,
    probe_host: String,
}

impl Default for ReadinessSection {
    fn default() -> Self {
        let defaults = ReadinessConfig::default();
        Self {
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            max_attempts: defaults.max_attempts,
            probe_timeout_ms: defaults.probe_timeout.as_millis() as u64,
            probe_host: defaults.probe_host,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct WatcherSection {
    repo_wait_attempts: u32,
    repo_wait_interval_ms: u64,
    debounce_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        let defaults = WatcherConfig::default();
        Self {
            repo_wait_attempts: defaults.repo_wait_attempts,
            repo_wait_interval_ms: defaults.repo_wait_interval.as_millis() as u64,
            debounce_ms: defaults.debounce.as_millis() as u64,
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // Loading the context already created a missing file.
    if ctx.paths.config_file.exists() && !cmd.force {
        info!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }
    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, || format!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_ping(ctx: &RuntimeContext) -> Result<()> {
    let runtime = ctx.runtime();
    runtime
        .ping()
        .await
        .with_context(|| format!("pinging {} runtime", runtime.runtime_type()))?;
    ctx.emit(&serde_json::json!({ "runtime": runtime.runtime_type(), "ok": true }), || {
        format!("{} runtime is reachable", runtime.runtime_type())
    })
}

fn session_line(session: &Session) -> String {
    let ports = session
        .ports()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<12}  {:<10}  {:<11}  {}",
        session.id(),
        session.status(),
        ports,
        session.config().branch,
        session.name()
    )
}

async fn handle_session(ctx: &RuntimeContext, command: SessionCommand) -> Result<()> {
    let events = Arc::new(EventHub::new());
    let service = ctx.session_service(events.clone()).await?;

    match command {
        SessionCommand::Create(cmd) => {
            let ssh_private_key = match cmd.ssh_key_file {
                Some(ref path) => Some(
                    fs::read_to_string(expand_path(path.clone())?)
                        .with_context(|| format!("reading SSH key {}", path.display()))?,
                ),
                None => None,
            };
            let request = CreateSessionRequest {
                name: cmd.name,
                repo_url: cmd.repo_url,
                branch: cmd.branch,
                git_user_name: cmd.git_user_name,
                git_user_email: cmd.git_user_email,
                ssh_private_key,
                claude_token: None,
                terminal_mode: Some(if cmd.single {
                    TerminalMode::Single
                } else {
                    TerminalMode::Dual
                }),
            };
            let session = service.create_session(request).await?;
            ctx.emit(&session, || session_line(&session))
        }
        SessionCommand::List { status } => {
            let filter = SessionFilter { status, name: None };
            let sessions = service.list_sessions(&filter).await?;
            ctx.emit(&sessions, || {
                sessions
                    .iter()
                    .map(session_line)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        SessionCommand::Info { id } => {
            let info = service.get_session_info(&id).await?;
            ctx.emit(&info, || {
                let state = info
                    .container
                    .as_ref()
                    .map(|c| c.state.to_string())
                    .unwrap_or_else(|| "absent".to_string());
                format!("{}\ncontainer: {}", session_line(&info.session), state)
            })
        }
        SessionCommand::Stop { id } => {
            let session = service.stop_session(&id).await?;
            ctx.emit(&session, || session_line(&session))
        }
        SessionCommand::Start { id } => {
            let session = service.start_session(&id).await?;
            ctx.emit(&session, || session_line(&session))
        }
        SessionCommand::Restart { id } => {
            let session = service.restart_session(&id).await?;
            ctx.emit(&session, || session_line(&session))
        }
        SessionCommand::Delete { id } => {
            service.delete_session(&id).await?;
            ctx.emit(&serde_json::json!({ "deleted": id }), || format!("deleted {id}"))
        }
        SessionCommand::Health { id } => {
            let health = service.check_terminal_health(&id).await?;
            ctx.emit(&health, || {
                format!(
                    "claude: {}  manual: {}  all ready: {}",
                    health.claude_ready, health.manual_ready, health.all_ready
                )
            })
        }
        SessionCommand::GitStatus { id } => {
            let status = service.get_git_status(&id).await?;
            ctx.emit(&status, || {
                format!(
                    "{}: {} changed file(s)",
                    status.branch, status.changed_file_count
                )
            })
        }
        SessionCommand::Commit { id, message } => {
            let outcome = service.commit_and_push(&id, &message).await?;
            ctx.emit(&outcome, || outcome.summary.clone())
        }
        SessionCommand::Watch => watch_events(ctx, &service, &events).await,
    }
}

async fn watch_events(
    ctx: &RuntimeContext,
    service: &SessionService,
    events: &EventHub,
) -> Result<()> {
    let mut rx = events.subscribe();
    let watching = service.resume_watchers().await?;
    info!("Watching {} running session(s); Ctrl-C to stop", watching);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Ok(event) => ctx.emit(&event, || describe_event(&event))?,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    service.shutdown();
    Ok(())
}

fn describe_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StatusChanged { session_id, status } => {
            format!("{session_id} status {status}")
        }
        SessionEvent::GitStatusChanged { session_id, status } => format!(
            "{session_id} {}: {} changed file(s)",
            status.branch, status.changed_file_count
        ),
    }
}

fn load_or_init_config(paths: &mut AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    Ok(built.try_deserialize()?)
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
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n# Override any key with {}__SECTION__KEY\n\n",
        path.display(),
        env_prefix()
    )
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
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
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
