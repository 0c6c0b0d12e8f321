use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use anyhow::Context;
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ledlink_server::config::settings::{OfflineBackend, QueueBackend};
use ledlink_server::config::{init_config, AppSettings};
use ledlink_server::db::{create_pool, verify_connection, PgOfflineMessageStore};
use ledlink_server::middleware::ServiceApiKey;
use ledlink_server::routes::{configure_public_routes, configure_routes};
use ledlink_server::security::{CredentialVerifier, HmacCredentialVerifier};
use ledlink_server::services::background_sweeps::{start_in_flight_sweep, start_offline_purge};
use ledlink_server::services::command_intake::CommandIntakeConsumer;
use ledlink_server::services::command_queue::{
    CommandQueueStore, MemoryCommandQueueStore, RedisCommandQueueStore,
};
use ledlink_server::services::inbound_report_handler::{
    InboundReportHandler, RedisReportPublisher, ReportConsumer,
};
use ledlink_server::services::offline_message_store::{
    MemoryOfflineMessageStore, OfflineMessageStore,
};
use ledlink_server::services::{
    CommandDispatcher, ConnectionRegistry, DispatcherConfig, HeartbeatMonitor,
};

async fn connect_redis(url: &str) -> anyhow::Result<Arc<redis::aio::ConnectionManager>> {
    let client = redis::Client::open(url).context("invalid REDIS_URL")?;
    let manager = redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;
    Ok(Arc::new(manager))
}

async fn build_offline_store(settings: &AppSettings) -> anyhow::Result<Arc<dyn OfflineMessageStore>> {
    match (&settings.storage.offline_backend, &settings.storage.database_url) {
        (OfflineBackend::Postgres, Some(database_url)) => {
            let pool = create_pool(database_url).await?;
            verify_connection(&pool).await?;
            let store = PgOfflineMessageStore::new(Arc::new(pool));
            store.ensure_schema().await?;
            info!("Offline message store backed by PostgreSQL");
            Ok(Arc::new(store))
        }
        (OfflineBackend::Postgres, None) => {
            anyhow::bail!("DATABASE_URL must be set when OFFLINE_STORE_BACKEND=postgres")
        }
        (OfflineBackend::Memory, _) => {
            warn!("Offline message store is in-memory; pending commands will not survive a restart");
            Ok(Arc::new(MemoryOfflineMessageStore::new()))
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let app_settings = init_config()?;

    let registry = Arc::new(ConnectionRegistry::new(app_settings.registry.shard_count));
    info!(shard_count = registry.shard_count(), "Connection registry initialized");

    let redis = match app_settings.storage.queue_backend {
        QueueBackend::Redis => Some(connect_redis(&app_settings.storage.redis_url).await?),
        QueueBackend::Memory => None,
    };

    let queue: Arc<dyn CommandQueueStore> = match &redis {
        Some(manager) => {
            info!("Command queue backed by Redis");
            Arc::new(RedisCommandQueueStore::new(manager.clone()))
        }
        None => {
            warn!("Command queue is in-memory; in-flight state is local to this process");
            Arc::new(MemoryCommandQueueStore::new())
        }
    };
    let offline = build_offline_store(&app_settings).await?;

    let dispatcher = Arc::new(CommandDispatcher::new(
        registry.clone(),
        queue,
        offline,
        DispatcherConfig::from_settings(&app_settings),
    ));

    let mut consumers: Vec<Arc<dyn ReportConsumer>> = Vec::new();
    if let Some(manager) = &redis {
        consumers.push(Arc::new(RedisReportPublisher::new(
            manager.clone(),
            app_settings.storage.report_channel.clone(),
        )));
    }
    let reports = InboundReportHandler::new(consumers);

    let verifier: Arc<dyn CredentialVerifier> = Arc::new(HmacCredentialVerifier::new(
        app_settings.auth.terminal_token_secret.clone(),
    ));

    // Background tasks
    HeartbeatMonitor::new(
        registry.clone(),
        Duration::from_secs(app_settings.heartbeat.scan_interval_secs),
        chrono::Duration::seconds(app_settings.heartbeat.timeout_secs as i64),
    )
    .start();
    start_in_flight_sweep(
        dispatcher.clone(),
        Duration::from_secs(app_settings.dispatch.in_flight_sweep_interval_secs.max(1)),
    );
    start_offline_purge(
        dispatcher.clone(),
        Duration::from_secs(app_settings.offline.purge_interval_secs.max(1)),
    );
    if let Some(manager) = &redis {
        CommandIntakeConsumer::new(
            manager.clone(),
            app_settings.dispatch.intake_key.clone(),
            dispatcher.clone(),
        )
        .start();
    }

    let host = &app_settings.server.host;
    let port = app_settings.server.port;
    info!("Starting server at http://{}:{}", host, port);

    let listener = TcpListener::bind(format!("{}:{}", host, port))?;
    let service_api_key = ServiceApiKey(app_settings.server.service_api_key.clone());
    if service_api_key.0.is_none() {
        warn!("SERVICE_API_KEY is not set; /api routes are unauthenticated");
    }

    let registry = web::Data::from(registry);
    let dispatcher = web::Data::from(dispatcher);
    let reports = web::Data::new(reports);
    let verifier = web::Data::from(verifier);
    let service_api_key = web::Data::new(service_api_key);
    let cors_origins = app_settings.server.cors_origins.clone();

    HttpServer::new(move || {
        // Configure CORS using actix-cors
        let mut cors = Cors::default();
        if cors_origins.iter().any(|origin| origin == "*") {
            cors = cors.allow_any_origin();
        } else {
            for origin in &cors_origins {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = cors.allow_any_method().allow_any_header();

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(registry.clone())
            .app_data(dispatcher.clone())
            .app_data(reports.clone())
            .app_data(verifier.clone())
            .app_data(service_api_key.clone())
            .configure(configure_public_routes)
            .configure(configure_routes)
    })
    .listen(listener)?
    .run()
    .await?;

    Ok(())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %format!("{:#}", e), "Cannot start LED terminal link server");
        std::process::exit(1);
    }
    Ok(())
}
