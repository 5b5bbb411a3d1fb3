use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use agora::api::{AppState, create_router};
use agora::auth::{AuthState, SessionRepository, SqliteSessionResolver};
use agora::config::{
    APP_NAME, AppConfig, AppPaths, load_or_init_config, parse_duration, write_default_config,
};
use agora::db::Database;
use agora::messages::SqliteMessageStore;
use agora::users::{User, UserRepository};
use agora::ws::Hub;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_users(ctx: RuntimeContext, cmd: UsersCommand) -> Result<()> {
    handle_users(&ctx, cmd).await
}

#[tokio::main]
async fn async_sessions(ctx: RuntimeContext, cmd: SessionsCommand) -> Result<()> {
    handle_sessions(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Users { command } => async_users(ctx, command),
        Command::Sessions { command } => async_sessions(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Agora - forum messaging server with real-time private messages.",
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
    /// Config file (or directory holding config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Silence all log output
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// More log output; repeat for trace
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,
    /// Log at trace level, wins over other flags
    #[arg(long, global = true)]
    trace: bool,
    /// Print results and logs as JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Print results as YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Never colorize logs
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// When to colorize logs
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Report what would change without writing anything
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Answer yes to confirmations
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Add targets and source locations to log lines
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
    /// Start the HTTP and WebSocket server
    Serve(ServeCommand),
    /// Write the default config file
    Init(InitCommand),
    /// Show or reset the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage user accounts
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Manage login sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the merged configuration
    Show,
    /// Print where the config file lives
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    /// Create a user
    Add {
        username: String,
        email: String,
        /// Password for the new account
        #[arg(long, env = "AGORA_USER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// List users
    List,
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// Issue a session token for a user
    Issue {
        username: String,
        /// Session lifetime, e.g. 12h or 7d (defaults to sessions.default_ttl)
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Revoke every session of a user
    Revoke { username: String },
    /// Delete expired sessions
    Cleanup,
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
        let config = load_or_init_config(&paths, common.dry_run)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = self.effective_log_level();
        let level_name = level.as_str().to_lowercase();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level_name},tower_http={level_name}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(self.use_color())
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Fallback for `log` records when no bridge into tracing was installed.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(level_name.as_str()),
        );
        builder.filter_level(level);
        builder.try_init().ok();
    }

    /// `--color` wins, then `NO_COLOR`/`FORCE_COLOR`, then whether stderr is a tty.
    fn use_color(&self) -> bool {
        if self.common.no_color {
            return false;
        }
        match self.common.color {
            ColorOption::Always => true,
            ColorOption::Never => false,
            ColorOption::Auto if env::var_os("NO_COLOR").is_some() => false,
            ColorOption::Auto => env::var_os("FORCE_COLOR").is_some() || io::stderr().is_terminal(),
        }
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
        for dir in [&self.paths.data_dir, &self.paths.state_dir] {
            if self.common.dry_run {
                info!("dry-run: not creating {}", dir.display());
                continue;
            }
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    async fn open_database(&self) -> Result<Database> {
        let db_path = self.paths.database_path(&self.config)?;
        debug!("Opening database {}", db_path.display());
        Database::new(&db_path).await
    }

    /// Print `value` as JSON/YAML when requested, otherwise run `human`.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            println!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            human();
        }
        Ok(())
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "{} exists, pass --force to replace it",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: not writing {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, || println!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: not resetting {}",
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

async fn handle_users(ctx: &RuntimeContext, cmd: UsersCommand) -> Result<()> {
    let database = ctx.open_database().await?;
    let users = UserRepository::new(database.pool().clone());

    match cmd {
        UsersCommand::Add {
            username,
            email,
            password,
        } => {
            if ctx.common.dry_run {
                info!("dry-run: would create user {}", username);
                return Ok(());
            }
            let user = users.create(&username, &email, &password).await?;
            ctx.emit(&user, || println!("Created user {} (id {})", user.username, user.id))
        }
        UsersCommand::List => {
            let all = users.list().await?;
            ctx.emit(&all, || {
                for user in &all {
                    println!("{:>6}  {:<24} {}", user.id, user.username, user.email);
                }
            })
        }
    }
}

async fn find_user(users: &UserRepository, username: &str) -> Result<User> {
    users
        .get_by_username(username)
        .await?
        .ok_or_else(|| anyhow!("user '{}' not found", username))
}

#[derive(Debug, Serialize)]
struct IssuedSession {
    user_id: agora_protocol::UserId,
    username: String,
    token: String,
    cookie: &'static str,
}

async fn handle_sessions(ctx: &RuntimeContext, cmd: SessionsCommand) -> Result<()> {
    let database = ctx.open_database().await?;
    let users = UserRepository::new(database.pool().clone());
    let sessions = SessionRepository::new(database.pool().clone());

    match cmd {
        SessionsCommand::Issue { username, ttl } => {
            let ttl = parse_duration(ttl.as_deref().unwrap_or(&ctx.config.sessions.default_ttl))?;
            let user = find_user(&users, &username).await?;
            if ctx.common.dry_run {
                info!("dry-run: would issue a session for {}", user.username);
                return Ok(());
            }
            let token = sessions.issue(user.id, ttl).await?;
            let issued = IssuedSession {
                user_id: user.id,
                username: user.username,
                token,
                cookie: agora::auth::SESSION_COOKIE,
            };
            ctx.emit(&issued, || println!("{}", issued.token))
        }
        SessionsCommand::Revoke { username } => {
            let user = find_user(&users, &username).await?;
            if ctx.common.dry_run {
                info!("dry-run: would revoke sessions of {}", user.username);
                return Ok(());
            }
            let removed = sessions.revoke_user(user.id).await?;
            info!("Revoked {} session(s) for {}", removed, user.username);
            Ok(())
        }
        SessionsCommand::Cleanup => {
            if ctx.common.dry_run {
                info!("dry-run: would delete expired sessions");
                return Ok(());
            }
            let removed = sessions.cleanup_expired().await?;
            info!("Removed {} expired session(s)", removed);
            Ok(())
        }
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting {} server...", APP_NAME);
    ctx.config.validate()?;

    let database = ctx.open_database().await?;
    let pool = database.pool().clone();

    let shutdown = CancellationToken::new();
    let (hub, hub_task) = Hub::spawn(&ctx.config.hub, shutdown.clone());

    let users = UserRepository::new(pool.clone());
    let sessions = SessionRepository::new(pool.clone());
    let _cleanup_handle = sessions
        .clone()
        .start_cleanup_task(ctx.config.sessions.cleanup_interval_secs, shutdown.clone());
    let resolver = SqliteSessionResolver::new(sessions, users.clone());

    let state = AppState {
        hub,
        hub_config: Arc::new(ctx.config.hub.clone()),
        users,
        messages: Arc::new(SqliteMessageStore::new(pool)),
        auth: AuthState::new(Arc::new(resolver)),
        allowed_origins: Arc::new(ctx.config.server.allowed_origins.clone()),
    };
    let app = create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Agora listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if let Err(e) = hub_task.await {
        warn!("Hub task ended abnormally: {}", e);
    }
    info!("Stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM and close every live connection.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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

    info!("Shutdown signal received, closing connections...");
    shutdown.cancel();
}
