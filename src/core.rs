use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::bitrix::BitrixClient;
use crate::channels::TelegramTransport;
use crate::config::{AppConfig, LinkSeed};
use crate::notifications::{DeadlineScanner, Engine, EventRouter};
use crate::state::{MemoryStateStore, SqliteStateStore};
use crate::traits::{ChatIdentity, StateStore, SystemClock};
use crate::webhook::{self, WebhookState};

/// Open the configured ledger, falling back to the in-memory one.
///
/// The fallback keeps the daemon running but dedup no longer survives a restart.
pub async fn open_store(db_path: &str) -> Arc<dyn StateStore> {
    if db_path.trim().is_empty() {
        warn!("No database configured; notification dedup is process-lifetime only");
        return Arc::new(MemoryStateStore::new());
    }
    match SqliteStateStore::new(db_path).await {
        Ok(store) => {
            info!("State store initialized ({})", db_path);
            Arc::new(store)
        }
        Err(e) => {
            error!(
                "Failed to open {}: {}; falling back to in-memory state, dedup will not survive a restart",
                db_path, e
            );
            Arc::new(MemoryStateStore::new())
        }
    }
}

/// Upsert identity links listed in the config.
pub async fn seed_links(store: &dyn StateStore, links: &[LinkSeed]) -> anyhow::Result<usize> {
    for seed in links {
        let mut identity = ChatIdentity::new(seed.telegram_id);
        if let Some(username) = seed.username.as_deref() {
            identity = identity.with_username(username);
        }
        store.link(&identity, seed.bitrix_user_id).await?;
    }
    Ok(links.len())
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. State store
    let store = open_store(&config.state.db_path).await;
    let seeded = seed_links(store.as_ref(), &config.identity.links).await?;
    if seeded > 0 {
        info!(count = seeded, "Seeded identity links from config");
    }

    // 2. CRM client
    let crm = Arc::new(BitrixClient::new(
        &config.bitrix.domain,
        &config.bitrix.webhook_token,
        Duration::from_secs(config.bitrix.request_timeout_secs.max(1)),
    )?);

    // 3. Telegram transport
    let transport = Arc::new(TelegramTransport::new(&config.telegram.bot_token));
    if let Err(e) = transport.verify().await {
        warn!("Telegram bot check failed, continuing: {}", e);
    }

    // 4. Engine
    let settings = config.engine_settings()?;
    info!(
        chat_id = settings.chat_id,
        topic_id = ?settings.topic_id,
        timezone = %settings.timezone,
        "Notification engine configured"
    );
    let engine = Arc::new(Engine::new(
        crm,
        store,
        transport,
        Arc::new(SystemClock),
        settings,
    ));

    // 5. Deadline scanner
    let scanner = Arc::new(DeadlineScanner::new(
        engine.clone(),
        &config.notifications.schedule,
    )?);
    scanner.spawn();

    // 6. Webhook server (blocks until shutdown)
    let state = WebhookState {
        router: Arc::new(EventRouter::new(engine)),
        application_token: config.application_token(),
    };
    if state.application_token.is_none() {
        warn!("bitrix.application_token is not set; webhook callers are not authenticated");
    }

    info!("Starting taskwatch v{}", env!("CARGO_PKG_VERSION"));
    tokio::select! {
        result = webhook::start_webhook_server(
            state,
            &config.server.bind,
            config.server.port,
            &config.server.webhook_path,
        ) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
