use std::sync::Arc;

use clap::Parser;
use tenantgate_server::cache::AuthorizationCache;
use tenantgate_server::cli::{Cli, Command};
use tenantgate_server::config::{AppConfig, CacheStoreKind, LogFormat, ResolverKind};
use tenantgate_server::metrics::AuthzMetrics;
use tenantgate_server::middleware::auth::AuthState;
use tenantgate_server::resolver::{PermissionResolver, PgPermissionResolver};
use tenantgate_server::rest;
use tenantgate_server::service::AuthzService;
use tenantgate_storage::memory::InMemoryCacheStore;
use tenantgate_storage::moka_store::MokaCacheStore;
use tenantgate_storage::postgres::TenantPool;
use tenantgate_storage::traits::CacheStore;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().pretty();
            registry.with(fmt_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    match cli.command {
        Some(Command::ParseKey { key }) => run_parse_key(&config, &key),
        Some(Command::Serve) | None => run_serve(config).await,
    }
}

fn run_parse_key(config: &AppConfig, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = config.keyspace().parse_key(key)?;

    println!("version:   v{}", parsed.version);
    println!("namespace: {}", parsed.namespace);
    println!("category:  {}", parsed.category);
    match &parsed.tenant_id {
        Some(tenant_id) => println!("tenant:    {tenant_id}"),
        None => println!("tenant:    (global)"),
    }
    println!("resource:  {}", parsed.resource);
    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        rest_addr = %config.rest_addr(),
        cache_store = ?config.cache.store,
        resolver = ?config.resolver.kind,
        production = config.authz.production,
        "starting tenantgate server"
    );

    let kinds = (config.cache.store.clone(), config.resolver.kind.clone());
    match kinds {
        (CacheStoreKind::Moka, ResolverKind::Static) => {
            let store = Arc::new(MokaCacheStore::new(config.cache.max_capacity));
            let resolver = config.static_resolver()?;
            serve(config, store, resolver).await
        }
        (CacheStoreKind::Memory, ResolverKind::Static) => {
            let store = Arc::new(InMemoryCacheStore::new());
            let resolver = config.static_resolver()?;
            serve(config, store, resolver).await
        }
        (CacheStoreKind::Moka, ResolverKind::Postgres) => {
            let store = Arc::new(MokaCacheStore::new(config.cache.max_capacity));
            let resolver = postgres_resolver(&config).await?;
            serve(config, store, resolver).await
        }
        (CacheStoreKind::Memory, ResolverKind::Postgres) => {
            let store = Arc::new(InMemoryCacheStore::new());
            let resolver = postgres_resolver(&config).await?;
            serve(config, store, resolver).await
        }
    }
}

async fn postgres_resolver(
    config: &AppConfig,
) -> Result<PgPermissionResolver, Box<dyn std::error::Error>> {
    let pool = TenantPool::connect(&config.database.url, config.database.max_connections).await?;
    tracing::info!(
        max_connections = config.database.max_connections,
        "connected tenant pool"
    );
    Ok(PgPermissionResolver::with_queries(
        pool,
        config.resolver.roles_query.clone(),
        config.resolver.permissions_query.clone(),
    ))
}

async fn serve<S, R>(
    config: AppConfig,
    store: Arc<S>,
    resolver: R,
) -> Result<(), Box<dyn std::error::Error>>
where
    S: CacheStore + 'static,
    R: PermissionResolver + 'static,
{
    let metrics = Arc::new(AuthzMetrics::with_config(config.metrics_config()));
    let cache = AuthorizationCache::new(
        store,
        Arc::new(config.keyspace()),
        config.cache_settings(),
        Arc::clone(&metrics),
    );
    let service = Arc::new(
        AuthzService::new(cache, Arc::new(resolver), metrics)
            .with_production(config.authz.production),
    );

    let auth = AuthState::from_config(&config.auth)?;
    let router = rest::create_router(rest::AppState::new(service), auth);

    let rest_addr: std::net::SocketAddr = config.rest_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(rest_addr).await?;
    tracing::info!(%rest_addr, "REST server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => { tracing::info!("received SIGINT"); }
                _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, using SIGINT only");
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT");
        }
    }
}
