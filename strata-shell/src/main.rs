//! Strata shell: a scripted session against an in-memory backing store.
//!
//! Two particles observe a shared collection and a status singleton, write
//! through their proxies, and watch a concurrent writer push the store past
//! a version gap. Every notification is logged, so the run shows optimistic
//! writes, echo suppression, desync and recovery.
//!
//! Configuration comes from the environment:
//!
//! | Variable               | Default | Meaning                                   |
//! |------------------------|---------|-------------------------------------------|
//! | `STRATA_GAP`           | 3       | Versions skipped by the concurrent writer |
//! | `STRATA_PAGE_SIZE`     | 4       | Cursor page size for the archive stream   |
//! | `STRATA_ARCHIVE_ITEMS` | 10      | Entries written to the archive            |
//! | `STRATA_SETTLE_MS`     | 25      | Pause between steps                       |
//!
//! Log filtering follows `RUST_LOG` and defaults to `info`.

use futures_util::StreamExt;
use log::info;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use strata_core::{Entity, StoreId};
use strata_proxy::{
    DeliveryError, FnObserver, HandleOptions, MemoryBackingStore, MemoryStoreConfig, Notification,
    Observer, ProxyConfig, ProxyContext, ProxyError, ProxyEvent, Registration, SchedulerConfig,
    StoreKind, SyncModel, UpdateDetails,
};

struct ShellConfig {
    gap: u64,
    page_size: usize,
    archive_items: usize,
    settle: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            gap: 3,
            page_size: 4,
            archive_items: 10,
            settle: Duration::from_millis(25),
        }
    }
}

impl ShellConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gap: env_or("STRATA_GAP", defaults.gap),
            page_size: env_or("STRATA_PAGE_SIZE", defaults.page_size),
            archive_items: env_or("STRATA_ARCHIVE_ITEMS", defaults.archive_items),
            settle: Duration::from_millis(env_or(
                "STRATA_SETTLE_MS",
                defaults.settle.as_millis() as u64,
            )),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {name}={raw}");
            default
        }),
        Err(_) => default,
    }
}

fn ids(entities: &[Entity]) -> String {
    let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    format!("[{}]", ids.join(", "))
}

fn describe(event: &ProxyEvent) -> String {
    match event {
        ProxyEvent::Sync(SyncModel::Collection(list)) => format!("replica {}", ids(list)),
        ProxyEvent::Sync(SyncModel::Singleton(data)) => format!("replica {data:?}"),
        ProxyEvent::Sync(SyncModel::Empty) => "ready".to_string(),
        ProxyEvent::Update(UpdateDetails::Collection {
            add,
            remove,
            originator_id,
        }) => format!(
            "+{} -{} from {}",
            ids(add),
            ids(remove),
            originator_id.as_ref().map_or("?", |p| p.as_str())
        ),
        ProxyEvent::Update(UpdateDetails::Singleton {
            data,
            originator_id,
        }) => format!(
            "{} from {}",
            data.as_ref()
                .map_or("cleared".to_string(), |d| d.raw_data.to_string()),
            originator_id.as_ref().map_or("?", |p| p.as_str())
        ),
        ProxyEvent::Desync => "replica fell behind the store".to_string(),
    }
}

fn logger() -> Arc<dyn Observer> {
    Arc::new(FnObserver(|n: &Notification| -> Result<(), DeliveryError> {
        info!(
            "[{}/{}] {} on {}: {}",
            n.particle,
            n.handle,
            n.event.kind(),
            n.store,
            describe(&n.event)
        );
        Ok(())
    }))
}

fn bound<'a, T>(
    proxy: Option<&'a T>,
    store: &StoreId,
    kind: StoreKind,
) -> Result<&'a T, ProxyError> {
    proxy.ok_or_else(|| ProxyError::KindMismatch {
        store: store.clone(),
        bound: "no-op",
        requested: kind.name(),
    })
}

/// Let the store answer and the scheduler drain.
async fn settle(ctx: &ProxyContext, config: &ShellConfig) {
    tokio::time::sleep(config.settle).await;
    ctx.scheduler().idle().await;
}

async fn run(config: ShellConfig) -> Result<(), ProxyError> {
    let (ctx, requests) = ProxyContext::channel(SchedulerConfig::default(), ProxyConfig::default());
    let (memory, events) = MemoryBackingStore::new(MemoryStoreConfig::default());
    let server = memory.spawn(requests);
    let router = tokio::spawn({
        let ctx = ctx.clone();
        async move { ctx.run(events).await }
    });

    let list = StoreId::new("shared-list");
    let status = StoreId::new("status");
    let archive = StoreId::new("archive");
    memory.create(list.clone(), StoreKind::Collection);
    memory.create(status.clone(), StoreKind::Singleton);
    memory.create(archive.clone(), StoreKind::BigCollection);

    // Both particles observe both stores.
    let list_proxy = ctx.proxy_for(list.clone(), StoreKind::Collection, "shared-list").await?;
    let status_proxy = ctx.proxy_for(status.clone(), StoreKind::Singleton, "status").await?;
    for particle in ["reader", "writer"] {
        let options = HandleOptions::synced().with_notify_desync(true);
        list_proxy
            .register(Registration::new(particle, "items", options, logger()))
            .await?;
        status_proxy
            .register(Registration::new(particle, "status", HandleOptions::synced(), logger()))
            .await?;
    }
    settle(&ctx, &config).await;

    let tasks = bound(list_proxy.as_collection(), &list, StoreKind::Collection)?;
    let phase = bound(status_proxy.as_singleton(), &status, StoreKind::Singleton)?;

    info!("--- writer adds three tasks");
    for i in 0..3 {
        let task = Entity::new(
            format!("task-{i}"),
            json!({"title": format!("Task {i}"), "done": false}),
        );
        tasks.store(task, vec![], "writer").await?;
    }
    phase.set(Entity::new("phase", json!({"phase": "editing"})), "writer").await?;
    settle(&ctx, &config).await;

    info!("--- an outside writer adds a task in order");
    memory.store_value(
        &list,
        Entity::new("task-remote", json!({"title": "From elsewhere", "done": false})),
        vec!["remote".into()],
        "outsider",
    );
    settle(&ctx, &config).await;

    info!("--- the outside writer skips {} versions", config.gap);
    if let Some(version) = memory.version(&list) {
        memory.set_version(&list, version + config.gap);
    }
    memory.store_value(
        &list,
        Entity::new("task-late", json!({"title": "Arrived after a gap", "done": false})),
        vec!["remote".into()],
        "outsider",
    );
    settle(&ctx, &config).await;
    info!(
        "shared-list at v{:?}, {} sync requests, {} updates queued",
        tasks.version().await,
        tasks.sync_requests().await,
        tasks.queued_updates().await
    );

    info!("--- reader removes a task, writer clears the status");
    tasks.remove("task-0", vec![], "reader").await?;
    phase.clear("writer").await?;
    settle(&ctx, &config).await;
    info!("shared-list now holds {}", ids(&tasks.to_list().await?));

    info!("--- streaming the archive");
    let big = ctx.proxy_for(archive.clone(), StoreKind::BigCollection, "archive").await?;
    let big = bound(big.as_big_collection(), &archive, StoreKind::BigCollection)?;
    for i in 0..config.archive_items {
        big.store(Entity::new(format!("entry-{i:03}"), json!({"n": i})), vec![], "writer")
            .await?;
    }
    let mut pages = big.stream(config.page_size, true).await?.into_stream();
    let mut page_count = 0;
    while let Some(page) = pages.next().await {
        page_count += 1;
        info!("archive page {page_count}: {}", ids(&page?));
    }

    info!(
        "context stats: {}",
        serde_json::to_string(&ctx.stats().await).unwrap_or_default()
    );
    info!(
        "scheduler stats: {}",
        serde_json::to_string(&ctx.scheduler().stats()).unwrap_or_default()
    );
    info!(
        "store stats: {}",
        serde_json::to_string(&memory.stats()).unwrap_or_default()
    );

    router.abort();
    server.abort();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Strata shell...");
    if let Err(e) = run(ShellConfig::from_env()).await {
        log::error!("Session failed: {e}");
        std::process::exit(1);
    }
}
