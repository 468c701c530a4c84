use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itemsync::{
    Backends, FieldSchema, Item, MemoryBackend, Origin, Store, StoreConfig, Target,
};
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "itemsync")]
#[command(about = "Simulate offline-first record synchronization against in-memory backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create records, optionally while the transporter is unreachable.
    Sync {
        #[arg(long, default_value_t = 3)]
        records: usize,
        /// Take the transporter offline while records are created
        #[arg(long)]
        offline: bool,
        /// Print every backend call
        #[arg(long)]
        trace_calls: bool,
    },
    /// Boot a store from a pre-filled local cache and transporter.
    Boot {
        #[arg(long, default_value_t = 2)]
        cached: usize,
        #[arg(long, default_value_t = 2)]
        remote: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Sync {
            records,
            offline,
            trace_calls,
        } => run_sync(records, offline, trace_calls).await,
        Command::Boot { cached, remote } => run_boot(cached, remote).await,
    }
}

fn backends(transporter: &Arc<MemoryBackend>, local: &Arc<MemoryBackend>) -> Backends {
    Backends::new(transporter.clone(), local.clone())
}

fn fields(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

async fn run_sync(records: usize, offline: bool, trace_calls: bool) -> Result<()> {
    let transporter = Arc::new(MemoryBackend::new(Target::Transporter, "id"));
    let local = Arc::new(MemoryBackend::new(Target::LocalCache, "localId"));
    let store = Store::open(
        Arc::new(FieldSchema::default()),
        backends(&transporter, &local),
        StoreConfig::new("demo"),
    )
    .await
    .context("failed to open store")?;

    if offline {
        transporter.set_available(false);
        println!("transporter offline");
    }

    for n in 1..=records {
        store.create(fields(json!({ "title": format!("record {n}") })), Origin::Fresh);
    }
    store.once_stored().await.context("local cache did not settle")?;
    print_items("after create", &store.items());

    if offline {
        transporter.set_available(true);
        println!("transporter back online");
    }
    store
        .once_synced()
        .await
        .context("transporter did not settle")?;
    store.once_stored().await.context("local cache did not settle")?;
    print_items("after sync", &store.items());

    if trace_calls {
        for (name, backend) in [("transporter", &transporter), ("local_cache", &local)] {
            for call in backend.calls() {
                println!("{name:>12} {:<13} {}", call.verb, Value::Object(call.payload));
            }
        }
    }
    Ok(())
}

async fn run_boot(cached: usize, remote: usize) -> Result<()> {
    let transporter = Arc::new(MemoryBackend::new(Target::Transporter, "id"));
    let local = Arc::new(MemoryBackend::new(Target::LocalCache, "localId"));

    for n in 1..=cached {
        let record = transporter.insert(fields(json!({ "title": format!("cached {n}") })));
        let mut cached_record = record.clone();
        cached_record.insert("transporterState".into(), json!("EXISTENT"));
        local.insert(cached_record);
    }
    for n in 1..=remote {
        transporter.insert(fields(json!({ "title": format!("remote {n}") })));
    }

    let store = Store::open(
        Arc::new(FieldSchema::default()),
        backends(&transporter, &local),
        StoreConfig::new("demo"),
    )
    .await
    .context("failed to open store")?;
    print_items("after load", &store.items());

    store.once_stored().await.context("local cache did not settle")?;
    print_items("after settle", &store.items());
    println!("local cache holds {} records", local.len());
    Ok(())
}

fn print_items(label: &str, items: &[Item]) {
    println!("== {label} ({} records)", items.len());
    for item in items {
        let transporter = item.target_state(Target::Transporter);
        let local = item.target_state(Target::LocalCache);
        println!(
            "  {:<10} {:<16} transporter={:<14} local={:<14} synced={} stored={}",
            item.id().to_string(),
            item.field("title")
                .and_then(|title| title.as_str().map(str::to_string))
                .unwrap_or_default(),
            transporter.marker().to_string(),
            local.marker().to_string(),
            item.synced(),
            item.stored(),
        );
    }
}
