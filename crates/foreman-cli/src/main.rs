use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use foreman_core::health::HealthStatus;
use foreman_core::Config;
use foreman_engine::{Engine, TaskRegistry};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod handlers;

#[derive(Debug, Parser)]
#[command(name = "foreman", about = "Task-queue orchestration service", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Host to bind to (overrides configuration).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind to (overrides configuration).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Enable debug mode.
    #[arg(long, global = true)]
    debug: bool,

    /// Log level (overrides configuration).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API server with monitoring loops.
    Api,
    /// Run the dashboard server.
    Dashboard,
    /// Run a worker process.
    Worker,
    /// Run only the monitoring loops.
    Monitor,
    /// Perform a one-time health check and exit.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if cli.debug {
        config.debug = true;
    }
    if let Some(log_level) = &cli.log_level {
        config.log_level = log_level.clone();
    }
    if let Some(host) = &cli.host {
        config.api.host = host.clone();
        config.dashboard.host = host.clone();
    }
    if let Some(port) = cli.port {
        match cli.command {
            Command::Dashboard => config.dashboard.port = port,
            _ => config.api.port = port,
        }
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Api => run_api(config).await.map(|_| ExitCode::SUCCESS),
        Command::Dashboard => run_dashboard(config).await.map(|_| ExitCode::SUCCESS),
        Command::Worker => run_worker(config).await.map(|_| ExitCode::SUCCESS),
        Command::Monitor => run_monitor(config).await.map(|_| ExitCode::SUCCESS),
        Command::Health => run_health(config).await,
    }
}

async fn connect_engine(config: Config) -> anyhow::Result<Arc<Engine>> {
    let registry = Arc::new(handlers::builtin_registry());
    let engine = Engine::connect(config, registry).await?;
    Ok(Arc::new(engine))
}

fn watch_ctrl_c(engine: &Arc<Engine>) {
    let flag = engine.shutdown_flag();

    tokio::task::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("got ctrl-c, shutting down");
        flag.raise();
    });
}

async fn run_api(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let engine = connect_engine(config).await?;

    watch_ctrl_c(&engine);

    // The shutdown controller drains the HTTP surface by raising the flag
    // the server's graceful shutdown waits on.
    {
        let flag = engine.shutdown_flag();
        engine.shutdown().on_shutdown("drain-http", move || {
            let flag = flag.clone();
            async move {
                flag.raise();
                Ok(())
            }
        });
    }

    let monitors = engine.start_monitoring();
    let app = foreman_api::router(engine.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("api server listening on {addr}");

    let flag = engine.shutdown_flag();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { flag.wait().await })
        .await?;

    for monitor in monitors {
        let _ = monitor.await;
    }

    tracing::info!("api server stopped");
    Ok(())
}

async fn run_dashboard(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.dashboard.host, config.dashboard.port);
    let engine = connect_engine(config).await?;

    watch_ctrl_c(&engine);

    let monitors = engine.start_monitoring();
    let app = foreman_api::dashboard_router(engine.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("dashboard listening on {addr}");

    let flag = engine.shutdown_flag();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { flag.wait().await })
        .await?;

    for monitor in monitors {
        let _ = monitor.await;
    }

    Ok(())
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let engine = connect_engine(config).await?;
    let mut worker = engine.build_worker().await?;

    let handle = worker.handle();
    tokio::task::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("got ctrl-c, shutting down worker");
        handle.shutdown();
    });

    let started = foreman_core::alarm::AlarmEvent::new(
        foreman_core::alarm::AlarmType::SystemError,
        foreman_core::alarm::AlarmSeverity::Info,
        "Worker Started",
        "A foreman worker has started successfully",
    )
    .for_component("worker");

    if let Err(e) = engine.alarms().trigger(started).await {
        tracing::warn!("failed to record worker start: {e}");
    }

    tracing::info!("worker starting");
    worker.run().await?;
    tracing::info!("worker stopped");

    Ok(())
}

async fn run_monitor(config: Config) -> anyhow::Result<()> {
    let engine = connect_engine(config).await?;

    watch_ctrl_c(&engine);

    let monitors = engine.start_monitoring();
    tracing::info!("monitoring loops started");

    engine.shutdown_flag().wait().await;

    for monitor in monitors {
        let _ = monitor.await;
    }

    Ok(())
}

async fn run_health(config: Config) -> anyhow::Result<ExitCode> {
    let engine = match connect_engine(config).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Health check failed: {e:#}");
            return Ok(ExitCode::from(2));
        }
    };

    let report = match engine.health().perform_check().await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Health check failed: {e:#}");
            return Ok(ExitCode::from(2));
        }
    };

    println!("Overall Status: {}", report.overall_status.as_str().to_uppercase());
    println!("Timestamp: {}", report.timestamp);
    println!("Uptime: {:.1} seconds", report.uptime_seconds);
    println!("\nComponent Status:");

    for component in &report.components {
        let symbol = match component.status {
            HealthStatus::Healthy => "+",
            HealthStatus::Degraded => "!",
            HealthStatus::Critical => "x",
            HealthStatus::Unknown => "?",
        };

        let response_time = component
            .response_time_ms
            .map(|ms| format!(" ({ms:.1}ms)"))
            .unwrap_or_default();
        let error = component
            .error_message
            .as_deref()
            .map(|msg| format!(" - {msg}"))
            .unwrap_or_default();

        println!(
            "  {symbol} {}{response_time}{error}",
            component.name.to_uppercase()
        );
    }

    Ok(match report.overall_status {
        HealthStatus::Healthy => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    })
}
