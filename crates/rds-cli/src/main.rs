//! rds-cli
//!
//! Thin operator binary over `rds-store`: status/health introspection and
//! a smoke-test driver against an in-memory backend. Grounded on
//! `mqk-cli`'s `clap::Parser`/`Subcommand` shape and its `anyhow::Context`
//! usage at the binary edge — the one place in this workspace `anyhow`
//! appears, since every library crate keeps `thiserror`'s closed-enum
//! discipline instead.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use rds_entity::{Entity, ValueMap};
use rds_store::{Backend, FetchPolicy, Store, StoreConfig};
use rds_testkit::InMemoryBackend;

#[derive(Parser)]
#[command(name = "rds-cli")]
#[command(about = "Operator CLI for the reactive data store core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a save/get/delete/sync pass against an in-memory backend and
    /// report pass/fail.
    Smoke,
    /// Print circuit, pool, and aggregate health status for a freshly
    /// initialized store.
    Status,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Probe {
    id: String,
    note: String,
}

impl Entity for Probe {
    type Id = String;
    fn id(&self) -> Self::Id {
        self.id.clone()
    }
    fn to_value_map(&self) -> ValueMap {
        rds_entity::to_value_map_via_serde(self).unwrap()
    }
    fn from_value_map(map: ValueMap) -> rds_error::StoreResult<Self> {
        rds_entity::from_value_map_via_serde(map)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Smoke => run_smoke().await,
        Commands::Status => run_status().await,
    }
}

async fn run_smoke() -> Result<()> {
    let backend: Arc<dyn Backend<Probe>> = Arc::new(InMemoryBackend::new());
    let store = Store::new(backend, StoreConfig::default());
    store.initialize().await.context("initialize store")?;

    let probe = Probe {
        id: "probe-1".into(),
        note: "rds-cli smoke test".into(),
    };
    store.save(probe.clone(), None).await.context("save probe")?;
    println!("save: ok");

    let got = store
        .get(probe.id.clone(), Some(FetchPolicy::CacheOnly))
        .await
        .context("get probe")?;
    if got.as_ref() != Some(&probe) {
        anyhow::bail!("get returned unexpected value: {got:?}");
    }
    println!("get: ok");

    store.delete(probe.id.clone()).await.context("delete probe")?;
    let gone = store
        .get(probe.id, Some(FetchPolicy::CacheOnly))
        .await
        .context("get after delete")?;
    if gone.is_some() {
        anyhow::bail!("entry survived delete");
    }
    println!("delete: ok");

    store.sync().await.context("sync")?;
    println!("sync: ok");

    store.close().await.context("close store")?;
    println!("smoke test passed");
    Ok(())
}

async fn run_status() -> Result<()> {
    let backend: Arc<dyn Backend<Probe>> = Arc::new(InMemoryBackend::new());
    let store = Store::new(backend, StoreConfig::default());
    store.initialize().await.context("initialize store")?;

    println!("circuit_state: {:?}", store.circuit_state());
    println!("pool_metrics: {:?}", store.pool_metrics().await);
    println!("health_status: {:?}", store.health_status().await);
    Ok(())
}
