//! Main daemon command - starts the daemon server.
//!
//! Grounded on the teacher's `cmd/root.rs` startup sequencing (load config,
//! build the dependency graph, wire the router, handle graceful shutdown via
//! an `axum_server::Handle`), generalized from a single `Manager` to the
//! full fleet-management dependency graph: vault -> executor -> fleet ->
//! {monitor, containers -> compose} -> {timeseries, alerts, notifier}, all
//! wired through a `PluginHost` instead of ad-hoc `tokio::spawn` calls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tracing::{error, info, warn};

use fleetctl_daemon::alerts::Evaluator;
use fleetctl_daemon::compose::Compose;
use fleetctl_daemon::config::Configuration;
use fleetctl_daemon::containers::Containers;
use fleetctl_daemon::database::Database;
use fleetctl_daemon::executor::Executor;
use fleetctl_daemon::fleet::Fleet;
use fleetctl_daemon::monitor::{Monitor, MonitorConfig};
use fleetctl_daemon::notifier::Notifier;
use fleetctl_daemon::plugin::{AlertNotificationPlugin, ContainerOrchestrationPlugin, FleetMonitorPlugin, Plugin, PluginHost};
use fleetctl_daemon::router::{self, AppState};
use fleetctl_daemon::timeseries::TimeSeries;
use fleetctl_daemon::vault::KeyVault;

/// Run the main daemon.
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    info!("Configuration loaded successfully");
    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Database: {}", config.database.path.display());

    info!("Loading key vault from: {}", config.vault.key_path.display());
    let vault = Arc::new(KeyVault::load(&config.vault.key_path)?);

    info!("Opening database");
    let db = Arc::new(Database::open(&config.database.path)?);

    let executor = Arc::new(Executor::new(
        vault.clone(),
        Duration::from_secs(config.ssh.idle_ttl_secs),
    ));
    let fleet = Arc::new(Fleet::new(db.clone(), vault.clone(), executor.clone()));
    let timeseries = Arc::new(TimeSeries::new(db.clone()));

    let monitor = Arc::new(Monitor::new(
        fleet.clone(),
        timeseries.clone(),
        MonitorConfig {
            default_interval: Duration::from_secs(config.monitor.default_interval_secs),
            min_interval: Duration::from_secs(config.monitor.min_interval_secs),
            probe_timeout: Duration::from_secs(config.ssh.exec_timeout_secs),
        },
    ));

    let containers = Arc::new(Containers::new(
        fleet.clone(),
        executor.clone(),
        db.clone(),
        timeseries.clone(),
    ));
    let compose = Arc::new(Compose::new(containers.clone(), db.clone()));

    let notifier = Arc::new(Notifier::new(
        db.clone(),
        config.notifier.max_attempts,
        config.notifier.retention_days,
    ));
    let evaluator = Arc::new(
        Evaluator::new(db.clone(), timeseries.clone()).with_notifier(notifier.clone()),
    );

    info!("Loading plugins");
    let plugins: Vec<Box<dyn Plugin>> = vec![
        Box::new(FleetMonitorPlugin {
            fleet: fleet.clone(),
            monitor: monitor.clone(),
        }),
        Box::new(ContainerOrchestrationPlugin {
            containers: containers.clone(),
            compose: compose.clone(),
        }),
        Box::new(AlertNotificationPlugin::new(
            evaluator.clone(),
            notifier.clone(),
            Duration::from_secs(config.alerts.eval_interval_secs),
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )),
    ];
    let plugin_host = Arc::new(PluginHost::load(plugins).await?);
    info!("Loaded plugins: {:?}", plugin_host.loaded_plugins());

    register_process_metrics();

    let rate_limiter =
        AppState::new_rate_limiter(config.rate_limit.requests_per_period, config.rate_limit.period_secs);

    let state = AppState {
        fleet,
        containers,
        compose,
        timeseries,
        db,
        monitor,
        evaluator,
        notifier,
        plugin_host: plugin_host.clone(),
        config: config.clone(),
        rate_limiter,
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .expect("invalid bind address");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_plugin_host = plugin_host.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        warn!("Received shutdown signal, stopping plugins...");
        shutdown_plugin_host.shutdown().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    if config.api.ssl.enabled {
        info!("Starting HTTPS server on {} (SSL enabled)", bind_addr);
        let tls_config = RustlsConfig::from_pem_file(&config.api.ssl.cert, &config.api.ssl.key)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load TLS config: {e}"))?;

        axum_server::bind_rustls(bind_addr, tls_config)
            .handle(handle)
            .serve(make_service)
            .await?;
    } else {
        info!("Starting HTTP server on {} (SSL disabled)", bind_addr);

        axum_server::bind(bind_addr)
            .handle(handle)
            .serve(make_service)
            .await?;
    }

    info!("Daemon stopped");
    Ok(())
}

/// Register process-level collectors against the global Prometheus registry
/// so `/metrics` reports something beyond an empty body.
fn register_process_metrics() {
    #[cfg(target_os = "linux")]
    {
        let collector = prometheus::process_collector::ProcessCollector::for_self();
        if let Err(e) = prometheus::register(Box::new(collector)) {
            error!(error = %e, "failed to register process metrics collector");
        }
    }
}
