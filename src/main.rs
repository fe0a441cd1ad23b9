use anyhow::Context;
use clap::Parser;
use serialtx::{CoordinatorConfig, DbError, EntityKey, MemoryStore, TransactionFactory};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Run contending writers against one shared session and report how the
/// transaction lock serialized them.
#[derive(Parser, Debug)]
#[command(name = "serialtx", version, about)]
struct Args {
    /// Number of concurrent workers
    #[arg(short, long, default_value_t = 8)]
    workers: usize,

    /// Transactions each worker runs
    #[arg(short, long, default_value_t = 10)]
    transactions: usize,

    /// Time each transaction keeps the lock, in milliseconds
    #[arg(long, default_value_t = 5)]
    hold_ms: u64,

    /// Lock wait budget, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    max_wait_ms: u64,

    /// Roll back every n-th transaction instead of committing (0 = never)
    #[arg(long, default_value_t = 0)]
    rollback_every: usize,
}

#[derive(Debug, Default)]
struct WorkerReport {
    committed: usize,
    rolled_back: usize,
    timed_out: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let config = CoordinatorConfig::new().max_wait(Duration::from_millis(args.max_wait_ms));
    let store = Arc::new(MemoryStore::new());
    let factory = TransactionFactory::new(store.clone(), config).context("invalid configuration")?;

    let started = Instant::now();
    let mut workers = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let factory = factory.clone();
        let hold = Duration::from_millis(args.hold_ms);
        let (transactions, rollback_every) = (args.transactions, args.rollback_every);
        workers.push(tokio::spawn(async move {
            run_worker(factory, worker, transactions, hold, rollback_every).await
        }));
    }

    let mut total = WorkerReport::default();
    for worker in workers {
        let report = worker.await.context("worker panicked")??;
        total.committed += report.committed;
        total.rolled_back += report.rolled_back;
        total.timed_out += report.timed_out;
    }

    println!("elapsed:      {:?}", started.elapsed());
    println!("committed:    {}", total.committed);
    println!("rolled back:  {}", total.rolled_back);
    println!("timed out:    {}", total.timed_out);
    println!("stored rows:  {}", store.len().await);
    Ok(())
}

async fn run_worker(
    factory: TransactionFactory,
    worker: usize,
    transactions: usize,
    hold: Duration,
    rollback_every: usize,
) -> anyhow::Result<WorkerReport> {
    let mut report = WorkerReport::default();

    for n in 0..transactions {
        let mut tx = match factory.create_transaction().await {
            Ok(tx) => tx,
            Err(DbError::LockTimeout { .. }) => {
                report.timed_out += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let key = EntityKey::new("events", format!("{}-{}", worker, n));
        tx.session()
            .await?
            .add(key, json!({ "worker": worker, "n": n }))?;
        tokio::time::sleep(hold).await;

        if rollback_every > 0 && (n + 1) % rollback_every == 0 {
            tx.rollback().await?;
            report.rolled_back += 1;
        } else {
            tx.commit().await?;
            report.committed += 1;
        }
    }

    Ok(report)
}
