use std::sync::Arc;

use eyre::eyre;
use tokio::time::{Duration, Instant, sleep};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber, util::SubscriberInitExt};

use courier_core::domain::{CreateMessage, ListQuery, Message, MessageId, MessageStatus, UserId};
use courier_core::ports::{SimulatedProvider, SystemClock};
use courier_core::queue::{InMemoryJobQueue, JobQueue};
use courier_core::store::InMemoryMessageStore;
use courier_core::{Config, MessageService, Processor, WorkerGroup};

/// Upper bound on how long the demo waits for one message to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

async fn wait_for(
    service: &MessageService,
    user: &UserId,
    id: &MessageId,
    done: impl Fn(MessageStatus) -> bool,
) -> eyre::Result<Message> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let mut last = None;
    loop {
        let message = service.get_by_id(user, id).await?;
        if last != Some(message.status) {
            println!("  {id}: {}", message.status);
            last = Some(message.status);
        }
        if done(message.status) {
            return Ok(message);
        }
        if Instant::now() >= deadline {
            return Err(eyre!("{id} stuck in {}", message.status));
        }
        sleep(Duration::from_millis(50)).await;
    }
}

fn settled(status: MessageStatus) -> bool {
    status.is_terminal()
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    info!(?config, "configuration loaded");

    // (A) in-memory store / queue / provider
    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryMessageStore::new(clock.clone()));
    let queue = Arc::new(InMemoryJobQueue::new(config.queue_settings()));
    let provider = Arc::new(SimulatedProvider::new(
        config.provider_delay(),
        config.fail_rate(),
    ));

    let service = MessageService::new(store.clone(), queue.clone(), config.send_policy());
    let processor = Processor::new(
        store,
        queue.clone(),
        provider,
        clock,
        config.processor_settings(),
    );

    // queue health
    let health = match queue.ping().await {
        Ok(()) => serde_json::json!({ "queue": "up" }),
        Err(err) => serde_json::json!({ "queue": "down", "error": err.to_string() }),
    };
    println!("health: {health}");

    // (B) workers
    let workers = WorkerGroup::spawn(config.worker_concurrency(), queue.clone(), Arc::new(processor));

    let user = UserId::new("demo-user");

    // (C) submit twice with the same client token: one message, one send job
    let request = CreateMessage::new("+15551234567", "Hello from courier").with_client_id("demo-1");
    let first = service.create(&user, request.clone()).await?;
    let replay = service.create(&user, request).await?;
    println!("submitted: {}", serde_json::to_string(&first.receipt())?);
    println!("replayed:  {}", serde_json::to_string(&replay.receipt())?);

    // (D) follow it to READ or FAILED, retrying once on failure
    let mut message = wait_for(&service, &user, &first.id, settled).await?;
    if message.status == MessageStatus::Failed {
        println!(
            "failed: {}",
            message.failed_reason.as_deref().unwrap_or("unknown")
        );
        let outcome = service.retry(&user, &first.id).await?;
        println!("retry: {}", serde_json::to_string(&outcome)?);
        message = wait_for(&service, &user, &first.id, settled).await?;
    }
    println!("final: {}", serde_json::to_string_pretty(&message)?);

    // (E) a second message whose receipts get cancelled after SENT
    let second = service
        .create(&user, CreateMessage::new("+15557654321", "Cancel my receipts"))
        .await?;
    let sent = wait_for(&service, &user, &second.id, |s| {
        s == MessageStatus::Sent || s.is_terminal()
    })
    .await?;
    if sent.status == MessageStatus::Sent {
        // receipts are scheduled right after SENT is written
        sleep(Duration::from_millis(20)).await;
        let outcome = service.cancel(&user, &second.id).await?;
        println!("cancel: {}", serde_json::to_string(&outcome)?);
    }

    // (F) maintenance sweep and a summary
    let requeued = service.requeue_orphaned().await?;
    println!("orphans re-enqueued: {}", requeued.len());

    let listed = service.list(&user, ListQuery::default()).await?;
    for m in &listed {
        println!("  {} {} queued_at={}", m.id, m.status, m.queued_at);
    }
    println!("queue: {}", serde_json::to_string(&queue.counts().await?)?);

    workers.shutdown_and_join().await;
    Ok(())
}
