use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use server::gateway::{self, GatewayServices, GatewayState};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tokio::{signal, sync::broadcast};
use tollgate_core::{
    analytics::AnalyticsRecorder,
    apispec::{self, ApiDefinition},
    config::Config,
    health::HealthMonitor,
    session::SessionManager,
    storage::{
        redis::RedisStore,
        rpc::{RpcClient, RpcStore, KEYSPACE_POLL_INTERVAL},
        KeyNamespace, KeyStore,
    },
};
use tower_http::{
    compression::CompressionLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(about = "Tollgate API gateway")]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(long, default_value = "./tollgate.conf")]
    conf: PathBuf,
}

/// Thin wrapper over the error chain, kept only so `main` can map
/// failures to the two fatal exit codes.
enum FatalError {
    Config(anyhow::Error),
    Storage(anyhow::Error),
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,tollgate_core={0},server={0}", config.logging.level))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

struct Stores {
    sessions: Arc<dyn KeyStore>,
    orgs: Arc<dyn KeyStore>,
    health: Arc<dyn KeyStore>,
    analytics: Arc<dyn KeyStore>,
    /// Present in edge-node mode; carries the pollers and the spec
    /// bundle source.
    rpc: Option<Arc<RpcStore>>,
}

async fn build_stores(config: &Config) -> anyhow::Result<Stores> {
    if config.slave_options.use_rpc {
        let client = RpcClient::connect(
            &config.slave_options.connection_string,
            &config.slave_options.api_key,
        )
        .await
        .context("RPC store init failed")?;

        let sessions = Arc::new(RpcStore::new(
            client.clone(),
            KeyNamespace::new("apikey-", config.hash_keys),
            config.slave_options.enable_rpc_cache,
        ));
        let orgs = Arc::new(RpcStore::new(
            client.clone(),
            KeyNamespace::new("orgKey.", config.hash_keys),
            false,
        ));
        let health = Arc::new(RpcStore::new(
            client.clone(),
            KeyNamespace::new("apihealth.", false),
            false,
        ));
        let analytics =
            Arc::new(RpcStore::new(client, KeyNamespace::new("analytics-", false), false));

        Ok(Stores { rpc: Some(sessions.clone()), sessions, orgs, health, analytics })
    } else {
        let connect = |prefix: &'static str, hash: bool| async move {
            RedisStore::connect(&config.storage, KeyNamespace::new(prefix, hash))
                .await
                .map(|s| Arc::new(s) as Arc<dyn KeyStore>)
                .context("redis init failed")
        };
        Ok(Stores {
            sessions: connect("apikey-", config.hash_keys).await?,
            orgs: connect("orgKey.", config.hash_keys).await?,
            health: connect("apihealth.", false).await?,
            analytics: connect("analytics-", false).await?,
            rpc: None,
        })
    }
}

async fn load_definitions(config: &Config, rpc: Option<&Arc<RpcStore>>) -> Vec<ApiDefinition> {
    if let Some(rpc) = rpc {
        match rpc.get_api_definitions(&config.slave_options.rpc_key, &[]).await {
            Ok(bundle) => match apispec::parse_definition_bundle(&bundle) {
                Ok(defs) => return defs,
                Err(e) => warn!(error = %e, "undecodable API definition bundle"),
            },
            Err(e) => warn!(error = %e, "API definition fetch failed"),
        }
        return Vec::new();
    }

    match apispec::load_definitions_dir(Path::new(&config.app_path)) {
        Ok(defs) => defs,
        Err(e) => {
            warn!(path = %config.app_path, error = %e, "API definition directory unreadable");
            Vec::new()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

async fn run(args: Args) -> Result<(), FatalError> {
    let config = Arc::new(
        Config::load(&args.conf)
            .with_context(|| format!("loading {}", args.conf.display()))
            .map_err(FatalError::Config)?,
    );
    init_logging(&config);
    info!(conf = %args.conf.display(), port = config.listen_port, "starting gateway");

    let stores = build_stores(&config).await.map_err(FatalError::Storage)?;

    let services = GatewayServices {
        sessions: Arc::new(SessionManager::new(
            stores.sessions.clone(),
            config.use_async_session_write,
        )),
        org_sessions: Arc::new(SessionManager::new(stores.orgs.clone(), false)),
        health: Arc::new(HealthMonitor::new(
            stores.health.clone(),
            config.health_check.enable_health_checks,
            config.health_check.health_check_value_timeouts,
        )),
        analytics: Arc::new(AnalyticsRecorder::new(
            stores.analytics.clone(),
            config.enable_analytics,
            config.analytics_config.ignored_ips.clone(),
        )),
        client: reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.http_server_options.write_timeout.max(1)))
            .build()
            .context("HTTP client build failed")
            .map_err(FatalError::Config)?,
        enforce_org_quotas: config.enforce_org_quotas,
        script_engine: None,
    };

    let defs = load_definitions(&config, stores.rpc.as_ref()).await;
    info!(apis = defs.len(), "API definitions loaded");

    let (reload_tx, mut reload_rx) = broadcast::channel::<()>(4);
    let state = Arc::new(GatewayState::new(
        gateway::build_apis(defs, &services),
        services.health.clone(),
        config.secret.clone(),
        reload_tx.clone(),
    ));

    // Reload listener: rebuilds the spec table from scratch and swaps
    // it in; requests already in flight keep the table they resolved
    // against.
    {
        let config = config.clone();
        let services = services.clone();
        let state = state.clone();
        let rpc = stores.rpc.clone();
        tokio::spawn(async move {
            while reload_rx.recv().await.is_ok() {
                info!("rebuilding API table");
                let defs = load_definitions(&config, rpc.as_ref()).await;
                state.swap(gateway::build_apis(defs, &services));
            }
        });
    }

    if let Some(rpc) = &stores.rpc {
        rpc.spawn_keyspace_poller(
            config.slave_options.rpc_key.clone(),
            Vec::new(),
            KEYSPACE_POLL_INTERVAL,
        );
        rpc.spawn_reload_poller(
            config.slave_options.rpc_key.clone(),
            reload_tx.clone(),
            KEYSPACE_POLL_INTERVAL,
        );
    } else {
        // Cluster reload notices arrive over the store's pub/sub.
        let tx = reload_tx.clone();
        let subscribed = stores
            .sessions
            .subscribe(
                "tollgate.cluster.notifications",
                Box::new(move |_, _| {
                    let _ = tx.send(());
                }),
            )
            .await;
        if let Err(e) = subscribed {
            warn!(error = %e, "cluster notification subscription failed");
        }
    }

    let app = gateway::router(state)
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.http_server_options.read_timeout.max(1),
        )))
        .layer(RequestBodyLimitLayer::new(gateway::MAX_BODY_BYTES))
        .layer(CompressionLayer::new());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!(address = %addr, "gateway listening");

    if config.http_server_options.use_ssl {
        let Some(cert) = config.http_server_options.certificates.first() else {
            return Err(FatalError::Config(anyhow::anyhow!(
                "use_ssl set but no certificates given"
            )));
        };
        let tls = RustlsConfig::from_pem_file(&cert.cert_file, &cert.key_file)
            .await
            .context("TLS setup failed")
            .map_err(FatalError::Config)?;
        let server = axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!(error = %e, "server error");
                }
            }
            () = shutdown_signal() => {}
        }
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind {addr}"))
            .map_err(FatalError::Config)?;
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal());
        if let Err(e) = server.await {
            error!(error = %e, "server error");
        }
    }

    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(FatalError::Config(error)) => {
            eprintln!("configuration error: {error:#}");
            ExitCode::from(1)
        }
        Err(FatalError::Storage(error)) => {
            eprintln!("storage error: {error:#}");
            ExitCode::from(2)
        }
    }
}
