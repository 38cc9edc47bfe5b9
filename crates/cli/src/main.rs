use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wagate_auth::AuthService;
use wagate_core::apikey::ApiKeyRole;
use wagate_core::audit::{AuditSink, RepoAuditSink};
use wagate_core::client::{UnconfiguredClient, WhatsAppClient};
use wagate_core::config::AppConfig;
use wagate_core::metrics::MetricsStore;
use wagate_core::repos::{
    ApiKeyRepository, AuditRepository, EventRepository, PresenceRepository, ReactionRepository,
    ReceiptRepository, SessionRepository, WebhookConfigRepository,
};
use wagate_dispatch::{DispatchConfig, Dispatcher, InteractionService};
use wagate_events::{
    EventHub, EventLogService, EventPublisher, HubConfig, RetentionConfig, RetentionJob,
    WebhookPublisher,
};
use wagate_persistence::{MemoryStores, SqliteStores};
use wagate_server::{AppState, Gateway, HealthRegistry, NamedCheck, RequestRateLimiter};
use wagate_session::{ClientEventRouter, SessionManager};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "wagate")]
#[command(version)]
#[command(about = "Multi-tenant WhatsApp gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve,
    /// Manage API keys
    Apikey {
        #[command(subcommand)]
        action: ApiKeyActions,
    },
}

#[derive(Subcommand)]
enum ApiKeyActions {
    /// Create a key; the plaintext is printed exactly once
    Create {
        /// read, write or admin
        #[arg(short, long)]
        role: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Revoke a key by id (terminal)
    Revoke {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// List keys (masked, never plaintext)
    List,
}

/// Every repository the gateway consumes, behind trait objects so the
/// memory and SQLite backends wire identically.
struct Repos {
    sessions: Arc<dyn SessionRepository>,
    api_keys: Arc<dyn ApiKeyRepository>,
    events: Arc<dyn EventRepository>,
    receipts: Arc<dyn ReceiptRepository>,
    reactions: Arc<dyn ReactionRepository>,
    presence: Arc<dyn PresenceRepository>,
    webhooks: Arc<dyn WebhookConfigRepository>,
    audit: Arc<dyn AuditRepository>,
    sqlite: Option<SqliteStores>,
}

async fn open_repos(database_url: &str) -> anyhow::Result<Repos> {
    if database_url == "memory" {
        info!("using in-memory repositories (no durability)");
        let stores = MemoryStores::new();
        return Ok(Repos {
            sessions: stores.sessions,
            api_keys: stores.api_keys,
            events: stores.events,
            receipts: stores.receipts,
            reactions: stores.reactions,
            presence: stores.presence,
            webhooks: stores.webhooks,
            audit: stores.audit,
            sqlite: None,
        });
    }
    let stores = SqliteStores::connect(database_url).await?;
    Ok(Repos {
        sessions: stores.sessions(),
        api_keys: stores.api_keys(),
        events: stores.events(),
        receipts: stores.receipts(),
        reactions: stores.reactions(),
        presence: stores.presence(),
        webhooks: stores.webhooks(),
        audit: stores.audit(),
        sqlite: Some(stores),
    })
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let repos = open_repos(&config.database.url).await?;
    let metrics = MetricsStore::new();
    let audit: Arc<dyn AuditSink> = Arc::new(RepoAuditSink::new(repos.audit.clone()));

    // Protocol client. The gateway consumes the WhatsAppClient interface;
    // swap this placeholder for a real client implementation to go live.
    let client: Arc<dyn WhatsAppClient> = Arc::new(UnconfiguredClient);

    let auth = Arc::new(
        AuthService::new(repos.api_keys.clone(), audit.clone())
            .with_enabled(config.apikey.enabled),
    );

    let hub = EventHub::new(
        HubConfig {
            api_key: config.websocket.api_key.clone(),
            auth_timeout: Duration::from_secs(config.websocket.auth_timeout_secs),
            ping_interval: Duration::from_secs(config.websocket.ping_interval_secs),
            pong_timeout: Duration::from_secs(config.websocket.pong_timeout_secs),
            queue_size: config.websocket.queue_size,
        },
        metrics.clone(),
    );
    let webhook_publisher =
        WebhookPublisher::new(repos.webhooks.clone(), audit.clone(), metrics.clone());
    let publisher = EventPublisher::new(
        repos.events.clone(),
        hub.clone(),
        webhook_publisher,
        metrics.clone(),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        client.clone(),
        publisher.clone(),
        audit.clone(),
        metrics.clone(),
        DispatchConfig {
            max_retries: config.dispatch.max_retries,
            rate_limit_per_second: config.whatsapp.rate_limit_per_second(),
            queue_size: config.dispatch.queue_size,
        },
        config.circuitbreaker.clone(),
    ));
    let interactions = Arc::new(InteractionService::new(
        client.clone(),
        publisher.clone(),
        repos.receipts.clone(),
        repos.reactions.clone(),
        repos.presence.clone(),
    ));
    let manager = SessionManager::new(
        repos.sessions.clone(),
        client.clone(),
        publisher.clone(),
        Duration::from_secs(config.whatsapp.qr_timeout_secs),
    );

    // Inbound push from the protocol client.
    let router = ClientEventRouter::new(manager.clone(), dispatcher.clone(), publisher.clone());
    client.register_event_handler(router);

    // Retention job for the event log.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let retention = RetentionJob::new(
        repos.events.clone(),
        &RetentionConfig {
            retention_days: config.events.retention_days,
            cleanup_interval: Duration::from_secs(config.events.cleanup_interval_secs),
            cleanup_time: config.events.cleanup_time.clone(),
        },
    )?;
    let retention_handle = retention.start(shutdown_rx);

    let limiter = RequestRateLimiter::new(config.ratelimit.clone());
    let limiter_cleanup = limiter.clone().start_cleanup();

    let mut health = HealthRegistry::new();
    if let Some(sqlite) = repos.sqlite.clone() {
        health = health.register(NamedCheck::new("database", move || {
            let sqlite = sqlite.clone();
            Box::pin(async move { sqlite.ping().await.is_ok() })
        }));
    }
    {
        let dispatcher = dispatcher.clone();
        let queue_cap = config.dispatch.queue_size;
        health = health.register(NamedCheck::new("dispatch", move || {
            let depth = dispatcher.queue_size();
            Box::pin(async move { depth < queue_cap })
        }));
    }

    let state = AppState {
        manager,
        dispatcher: dispatcher.clone(),
        interactions,
        auth,
        event_log: Arc::new(EventLogService::new(repos.events.clone())),
        publisher,
        hub: hub.clone(),
        client,
        webhooks: repos.webhooks.clone(),
        metrics,
        health: Arc::new(health),
        limiter,
        api_key_header: config.apikey.header.clone(),
    };

    let gateway = Gateway::new(state, &config.server.host, config.server.port);
    gateway
        .serve(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            }
        })
        .await?;

    // Shutdown ordering: intake already stopped with the server; drain the
    // dispatch queue, stop the retention job, close the hub last.
    info!("draining dispatch queue");
    dispatcher.close(SHUTDOWN_DRAIN).await;
    let _ = shutdown_tx.send(true);
    let _ = retention_handle.await;
    limiter_cleanup.abort();
    hub.stop().await;
    info!("gateway stopped");
    Ok(())
}

async fn apikey_command(config: AppConfig, action: ApiKeyActions) -> anyhow::Result<()> {
    let repos = open_repos(&config.database.url).await?;
    let audit: Arc<dyn AuditSink> = Arc::new(RepoAuditSink::new(repos.audit.clone()));
    let auth = AuthService::new(repos.api_keys.clone(), audit);

    match action {
        ApiKeyActions::Create { role, description } => {
            let role = ApiKeyRole::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("unknown role: {} (read|write|admin)", role))?;
            let created = auth.create_key(role, description, "cli").await?;
            println!("id:      {}", created.key.id);
            println!("role:    {}", created.key.role.as_str());
            println!("api key: {}", created.plaintext);
            println!("store the key now; it cannot be shown again");
        }
        ApiKeyActions::Revoke { id, reason } => {
            let key = auth.revoke_key(&id, "cli", reason).await?;
            println!(
                "revoked {} at {}",
                key.id,
                key.revoked_at.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
        }
        ApiKeyActions::List => {
            let keys = auth.list(1, 100).await?;
            for key in keys {
                println!(
                    "{}  {:<5}  active={}  created={}  {}",
                    key.id,
                    key.role.as_str(),
                    key.is_active,
                    key.created_at.format("%Y-%m-%d %H:%M"),
                    key.description.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.clone())
        .map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;
    init_tracing(&config.log.level);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Apikey { action } => apikey_command(config, action).await,
    }
}
