use clap::{Parser, Subcommand};
use courier::application::consumer::{BoxError, ReliableMessageConsumer};
use courier::application::messaging::MessagingService;
use courier::config::MessagingConfig;
use courier::domain::event::DomainEvent;
use courier::domain::message::{Message, PublishOptions};
use courier::domain::ports::SharedBroker;
use courier::domain::topology::queues;
use courier::infrastructure::in_memory::InMemoryBroker;
#[cfg(feature = "storage-rocksdb")]
use courier::infrastructure::rocksdb::RocksDbBroker;
use courier::sync::AtomicCounter;
use courier::telemetry::init_tracing;
use miette::{IntoDiagnostic, Result, miette};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// JSON file overriding the messaging defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish one event and print whether the broker accepted it.
    Publish {
        #[arg(long)]
        queue: String,
        /// Event as a JSON object with a string "type".
        #[arg(long)]
        event: String,
        #[arg(long, default_value_t = 0)]
        priority: u8,
        #[arg(long)]
        expiration_ms: Option<u64>,
        /// Publish without the persistent flag.
        #[arg(long)]
        transient: bool,
    },
    /// Print message and consumer counts for a queue.
    Stats {
        #[arg(long)]
        queue: String,
    },
    /// Print the broker health report.
    Health,
    /// Remove dead-letter records and print one per line.
    DrainDlq {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Run a payment.created consumer whose handler fails the first N attempts.
    Simulate {
        #[arg(long, default_value_t = 2)]
        failures: u32,
        #[arg(long, default_value_t = 10)]
        base_delay_ms: u64,
    },
}

#[cfg(feature = "storage-rocksdb")]
async fn open_broker(db_path: Option<PathBuf>, config: &MessagingConfig) -> Result<SharedBroker> {
    if let Some(db_path) = db_path {
        let broker = RocksDbBroker::open_with_capacity(db_path, config.queue_capacity)
            .await
            .into_diagnostic()?;
        return Ok(Arc::new(broker));
    }
    Ok(Arc::new(InMemoryBroker::with_capacity(config.queue_capacity)))
}

#[cfg(not(feature = "storage-rocksdb"))]
async fn open_broker(db_path: Option<PathBuf>, config: &MessagingConfig) -> Result<SharedBroker> {
    if db_path.is_some() {
        tracing::warn!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryBroker::with_capacity(config.queue_capacity)))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value).into_diagnostic()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MessagingConfig::from_json_file(path).into_diagnostic()?,
        None => MessagingConfig::default(),
    };
    if let Command::Simulate { base_delay_ms, .. } = &cli.command {
        config.base_retry_delay_ms = *base_delay_ms;
        config.max_retry_delay_ms = config.max_retry_delay_ms.max(*base_delay_ms);
    }

    let broker = open_broker(cli.db_path, &config).await?;
    let service = MessagingService::start(broker, &config)
        .await
        .into_diagnostic()?;

    let outcome = run(cli.command, &service, &config).await;
    service.shutdown().await.into_diagnostic()?;
    outcome
}

async fn run(command: Command, service: &MessagingService, config: &MessagingConfig) -> Result<()> {
    match command {
        Command::Publish {
            queue,
            event,
            priority,
            expiration_ms,
            transient,
        } => {
            let event: Value = serde_json::from_str(&event).into_diagnostic()?;
            let mut options = if transient {
                PublishOptions::transient()
            } else {
                PublishOptions::default()
            };
            options = options.with_priority(priority);
            if let Some(ms) = expiration_ms {
                options = options.with_expiration(Duration::from_millis(ms));
            }

            let (accepted, key) = service
                .publisher()
                .publish_with_key(&queue, &event, options)
                .await
                .into_diagnostic()?;
            print_json(&json!({ "accepted": accepted, "idempotencyKey": key }))
        }
        Command::Stats { queue } => {
            let stats = service.get_queue_stats(&queue).await.into_diagnostic()?;
            print_json(&json!({
                "queue": queue,
                "messageCount": stats.message_count,
                "consumerCount": stats.consumer_count,
            }))
        }
        Command::Health => print_json(&service.health_check().await),
        Command::DrainDlq { limit } => {
            for record in service.dead_letters().drain(limit).await.into_diagnostic()? {
                print_json(&record)?;
            }
            Ok(())
        }
        Command::Simulate { failures, .. } => simulate(service, config, failures).await,
    }
}

async fn simulate(service: &MessagingService, config: &MessagingConfig, failures: u32) -> Result<()> {
    let attempts = Arc::new(AtomicCounter::default());
    let seen = attempts.clone();
    service
        .consumer()
        .subscribe(queues::PAYMENT_CREATED, move |message: Message| {
            let seen = seen.clone();
            async move {
                let attempt = seen.increment();
                tracing::info!(attempt, retry_count = message.retry_count, "simulated handler invoked");
                Ok::<_, BoxError>(attempt > i64::from(failures))
            }
        })
        .await
        .into_diagnostic()?;

    let event = DomainEvent::PaymentCreated {
        payment_id: "pm_1".to_string(),
        amount: dec!(1000),
        currency: None,
    };
    let accepted = service
        .publisher()
        .publish_event(&event, PublishOptions::default())
        .await
        .into_diagnostic()?;
    if !accepted {
        return Err(miette!("broker did not accept the simulated event"));
    }

    let budget = (0..=config.max_retries)
        .map(|n| config.base_retry_delay().saturating_mul(1 << n.min(31)))
        .fold(Duration::from_secs(5), Duration::saturating_add);
    tokio::time::timeout(budget, settled(service.consumer()))
        .await
        .map_err(|_| miette!("simulated message did not settle within {budget:?}"))?;

    let stats = service.consumer().stats();
    print_json(&json!({
        "attempts": attempts.get(),
        "acked": stats.acked > 0,
        "deadLettered": stats.dead_lettered > 0,
    }))
}

async fn settled(consumer: &ReliableMessageConsumer) {
    loop {
        let stats = consumer.stats();
        if stats.acked + stats.dead_lettered > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
