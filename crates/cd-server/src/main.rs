//! cd-server: wires QRL/ASG/BW/DO/EB behind the bus consumers and the HTTP
//! read-model surface (spec §6). Grounded on `deployer/src/main.rs`'s
//! wiring shape: parse args, stand up persistence, register the tracing
//! layer that rides on it, connect every downstream dependency, replay
//! durable state, then serve.

mod builds;
mod bus;
mod http;
mod pg_sink;
mod pg_store;
mod projects;
mod quota_source;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use cd_asg::gateway::S3ArtifactStore;
use cd_broker::EventBroker;
use cd_build_worker::{BuildWorker, BuildWorkerConfig};
use cd_common::config::Args;
use cd_common::routing::FileRoutingPublisher;
use cd_deploy_orchestrator::{
    default_policy, BollardRuntime, Cleanup, DeployOrchestrator, HttpHealthProbe,
    OrchestratorConfig, Reaper, ZeroMetricsSource,
};
use cd_qrl::redis_backend::RedisQuotaLimiter;
use cd_qrl::sweeper::Sweeper;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::http::AppState;
use crate::pg_sink::PgLogSink;
use crate::pg_store::PgDeploymentStore;
use crate::quota_source::PgActiveCountSource;
use crate::telemetry::BrokerLayer;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_BUS_FAILURE: i32 = 2;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("invalid configuration: {e}");
        return EXIT_CONFIG_ERROR;
    }

    let pool = match PgPoolOptions::new()
        .max_connections(20)
        .connect(&args.postgres_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("failed to connect to postgres: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        eprintln!("failed to run migrations: {e}");
        return EXIT_CONFIG_ERROR;
    }

    let broker = EventBroker::new(Arc::new(PgLogSink::new(pool.clone())));
    broker.spawn_heartbeat();

    tracing_subscriber::registry()
        .with(BrokerLayer::new(broker.clone()))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let quota: Arc<dyn cd_qrl::limiter::QuotaLimiter> =
        match RedisQuotaLimiter::connect(&args.cache_url).await {
            Ok(limiter) => Arc::new(limiter),
            Err(e) => {
                error!(error = %e, "failed to connect to quota cache");
                return EXIT_CONFIG_ERROR;
            }
        };

    let sweeper_conn = match redis::Client::open(args.cache_url.as_str()) {
        Ok(client) => match client.get_tokio_connection_manager().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "failed to open sweeper redis connection");
                return EXIT_CONFIG_ERROR;
            }
        },
        Err(e) => {
            error!(error = %e, "invalid cache url");
            return EXIT_CONFIG_ERROR;
        }
    };

    let artifact_store: Arc<dyn cd_asg::gateway::ArtifactStore> = match S3ArtifactStore::connect(
        &args.store_endpoint,
        &args.store_access,
        &args.store_secret,
        &args.store_bucket,
        args.store_tls,
    )
    .await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to connect to artifact store");
            return EXIT_CONFIG_ERROR;
        }
    };

    let docker = match Docker::connect_with_local_defaults() {
        Ok(docker) => docker,
        Err(e) => {
            error!(error = %e, "failed to connect to docker");
            return EXIT_CONFIG_ERROR;
        }
    };

    let bus_conn = match bus::connect(&args.bus_url).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "failed to connect to bus");
            return EXIT_CONFIG_ERROR;
        }
    };
    if let Err(e) = bus::declare_topology(&bus_conn).await {
        error!(error = %e, "failed to declare bus topology");
        return EXIT_CONFIG_ERROR;
    }
    let bus_conn = Arc::new(bus_conn);

    let store: Arc<dyn cd_deploy_orchestrator::store::DeploymentStore> =
        Arc::new(PgDeploymentStore::new(pool.clone()));
    let runtime: Arc<dyn cd_deploy_orchestrator::containers::ContainerRuntime> =
        Arc::new(BollardRuntime::new(docker.clone()));
    let routing: Arc<dyn cd_common::routing::RoutingPublisher> =
        Arc::new(FileRoutingPublisher::new(args.routing_root.clone()));

    let build_worker = Arc::new(BuildWorker::new(
        docker,
        artifact_store,
        quota.clone(),
        broker.clone(),
        BuildWorkerConfig {
            scratch_root: args.scratch_root.clone(),
            registry_prefix: args.registry_prefix.clone(),
            build_timeout: args.build_timeout,
            max_artifact_bytes: args.max_artifact_bytes,
            clone_retry_attempts: args.clone_retry_attempts,
        },
    ));

    let mut orchestrator_config = OrchestratorConfig::default();
    orchestrator_config.health_policy = {
        let mut policy = default_policy();
        policy.interval = args.health_interval;
        policy.threshold = args.health_threshold;
        policy
    };
    orchestrator_config.canary_traffic_pct = args.canary_pct;
    orchestrator_config.canary_hold = args.canary_window;
    orchestrator_config.max_retries = args.max_deployment_retries;

    let orchestrator = Arc::new(DeployOrchestrator::new(
        store.clone(),
        runtime.clone(),
        routing.clone(),
        Arc::new(HttpHealthProbe::new("/health")),
        Arc::new(ZeroMetricsSource),
        quota.clone(),
        broker.clone(),
        orchestrator_config,
    ));

    let cleanup = Arc::new(Cleanup::new(store.clone(), runtime.clone(), routing.clone()));

    let reaper = Arc::new(Reaper::new(store.clone(), runtime.clone(), routing.clone()));
    reaper.spawn();

    let active_count_source: Arc<dyn cd_qrl::sweeper::ActiveCountSource> =
        Arc::new(PgActiveCountSource::new(pool.clone()));
    let sweeper = Sweeper::new(sweeper_conn, active_count_source, Duration::from_secs(60));
    tokio::spawn(sweeper.run());

    let build_consumer = {
        let conn = bus_conn.clone();
        let pool = pool.clone();
        let worker = build_worker.clone();
        tokio::spawn(async move { bus::run_build_consumer(&conn, pool, worker).await })
    };
    let deploy_consumer = {
        let conn = bus_conn.clone();
        let pool = pool.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { bus::run_deploy_consumer(&conn, pool, orchestrator).await })
    };
    let cleanup_consumer = {
        let conn = bus_conn.clone();
        let cleanup = cleanup.clone();
        tokio::spawn(async move { bus::run_cleanup_consumer(&conn, cleanup).await })
    };

    let state = AppState {
        pool: pool.clone(),
        store: store.clone(),
        broker: broker.clone(),
        bus: bus_conn.clone(),
    };
    let app = http::router(state);

    info!(addr = %args.bind_addr, "cd-server listening");

    tokio::select! {
        result = axum::Server::bind(&args.bind_addr).serve(app.into_make_service()) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited with an error");
                return EXIT_BUS_FAILURE;
            }
        }
        result = build_consumer => {
            error!(?result, "build consumer task exited");
            return EXIT_BUS_FAILURE;
        }
        result = deploy_consumer => {
            error!(?result, "deploy consumer task exited");
            return EXIT_BUS_FAILURE;
        }
        result = cleanup_consumer => {
            error!(?result, "cleanup consumer task exited");
            return EXIT_BUS_FAILURE;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    EXIT_OK
}
