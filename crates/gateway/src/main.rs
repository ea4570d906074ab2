use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use ov_client::subprocess::SubprocessClient;
use ov_domain::config::{Config, ConfigSeverity, CorsConfig};
use ov_gateway::api;
use ov_gateway::state::{build_state, AppState};

#[derive(Parser)]
#[command(name = "overseer", about = "Multi-session agent orchestration runtime")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "overseer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Run an autonomous Worker–Checker session from a run config file,
    /// without the server.
    Autopilot {
        /// Path to the run config (worker + checker + task + session).
        #[arg(long)]
        run_config: PathBuf,
    },
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the configuration and report issues.
    Validate,
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Autopilot { run_config }) => {
            init_tracing();
            let config = Config::load(&cli.config)?;
            run_autopilot(Arc::new(config), &run_config).await
        }
        Some(Command::Config {
            command: ConfigCommand::Validate,
        }) => {
            let config = Config::load(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => println!("warning: {issue}"),
                    ConfigSeverity::Error => println!("error: {issue}"),
                }
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Config {
            command: ConfigCommand::Show,
        }) => {
            let config = Config::load(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("overseer {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ov_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Overseer starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Runtime state ────────────────────────────────────────────────
    let factory = SubprocessClient::factory(config.client.clone());
    let state = build_state(config.clone(), factory).context("initializing runtime state")?;
    tracing::info!(
        state_path = %config.storage.state_path.display(),
        endpoints = config.endpoints.len(),
        "runtime ready"
    );

    // ── Idle session sweeper ─────────────────────────────────────────
    spawn_idle_sweeper(state.clone());

    // ── Router ───────────────────────────────────────────────────────
    let state_for_shutdown = state.clone();
    let cors_layer = build_cors_layer(&config.server.cors);
    let app = api::router()
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Overseer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // Drain: running tasks are recorded as cancelled, clients closed.
    state_for_shutdown.tasks.shutdown().await;
    state_for_shutdown.manager.close_all().await;
    tracing::info!("Overseer stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Drive one autonomous session to a terminal status and print the result.
async fn run_autopilot(config: Arc<Config>, run_config_path: &std::path::Path) -> anyhow::Result<()> {
    use ov_autopilot::config::RunConfig;
    use ov_autopilot::{ClientWorker, Orchestrator};

    let run_config = RunConfig::load(run_config_path).context("loading run config")?;
    let factory = SubprocessClient::factory(config.client.clone());
    let worker = Arc::new(ClientWorker::new(factory, config.endpoints.clone()));

    let orchestrator = Orchestrator::new(config.storage.workspace_dir(), worker);
    let session = orchestrator.create_session(
        run_config.task,
        run_config.worker,
        run_config.checker,
        None,
        run_config.session,
    )?;
    tracing::info!(session_id = %session.session_id, "autopilot session created");

    let final_state = orchestrator.run(&session.session_id).await?;
    println!(
        "session {} finished: status={:?}, cycles={}",
        final_state.session_id, final_state.status, final_state.cycle_count
    );
    for record in &final_state.history {
        println!(
            "  cycle {}: passed={} reason={}",
            record.cycle_index,
            record.passed,
            record.checker_reason.as_deref().unwrap_or("-"),
        );
    }
    if final_state.status != ov_autopilot::SessionStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

/// Periodically close managed sessions that have been idle past the
/// threshold, skipping any session with a running task.
fn spawn_idle_sweeper(state: AppState) {
    let period = std::time::Duration::from_secs(state.config.sessions.cleanup_interval_secs);
    let max_idle = std::time::Duration::from_secs(state.config.sessions.idle_timeout_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            for session_id in state.manager.idle_sessions(max_idle).await {
                if state.tasks.is_running(&session_id) {
                    tracing::debug!(session_id, "skipping idle cleanup: task running");
                    continue;
                }
                tracing::info!(session_id, "closing idle session");
                state.manager.close_session(&session_id).await;
            }
        }
    });
}

/// Build a [`CorsLayer`] from the configured allowed origins. A trailing
/// `:*` wildcard matches any port on that host; a literal `"*"` allows all
/// origins.
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();
    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(value) = origin.parse::<HeaderValue>() {
            exact.push(value);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            let origin_str = origin.to_str().unwrap_or("");
            // The remainder after the prefix must be digits only, so
            // "http://localhost:3000.evil.com" cannot slip through.
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}
