use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use sea_orm::{ConnectOptions, Database};
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetctl::agent_service::{AgentClient, HttpAgentClient};
use fleetctl::db::{schema, MemoryStore, SeaOrmStore, Store};
use fleetctl::notifications::{AdminNotifier, LogNotifier, WebhookNotifier};
use fleetctl::server::config::ServerConfig;
use fleetctl::server::control_plane::{ControlDeps, ControlPlane};
use fleetctl::services::geo::StaticGeoLocator;
use fleetctl::services::health_checker::AgentProber;
use fleetctl::version::VERSION;
use fleetctl::web::create_axum_router;

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) -> tracing_appender::non_blocking::WorkerGuard {
    // Log to a file: JSON format, daily rotation
    let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, "fleetctl.log"));
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
    guard
}

async fn open_store(config: &ServerConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error + Send + Sync>> {
    match &config.database_url {
        Some(url) => {
            let mut opt = ConnectOptions::new(url.to_owned());
            opt.max_connections(10).sqlx_logging(false);
            let db = Database::connect(opt).await?;
            schema::create_tables(&db).await?;
            info!("Connected to database.");
            Ok(Arc::new(SeaOrmStore::new(db)))
        }
        None => {
            info!("No database_url configured; using the in-memory store.");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c.");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let server_config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };
    let _log_guard = init_logging(&server_config.log_dir);
    info!(version = VERSION, "Starting fleetctl server.");

    let store = open_store(&server_config).await?;
    let agent_client = Arc::new(HttpAgentClient::new(
        &server_config.agent_scheme,
        server_config.sync.timeout(),
    )?);
    let prober = Arc::new(AgentProber::new(
        agent_client.clone() as Arc<dyn AgentClient>,
        server_config.health.probe_timeout(),
    ));
    let notifier: Arc<dyn AdminNotifier> = match &server_config.notification_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let control = Arc::new(ControlPlane::new(
        &server_config,
        ControlDeps {
            store,
            agent_client,
            prober,
            geo: Arc::new(StaticGeoLocator::new()),
            notifier,
        },
    )?);
    control.start().await;

    let addr: SocketAddr = server_config.listen_addr.parse()?;
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    info!(address = %addr, "HTTP server listening.");

    let app = create_axum_router(control.clone(), server_config.clone());
    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    control.stop().await;
    if let Err(e) = served {
        error!(error = %e, "HTTP server exited with an error.");
        return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>);
    }
    info!("Server stopped.");
    Ok(())
}
