//! rds-conflict
//!
//! Conflict detection and user-pluggable resolution (spec §4.11, C11).
//! The broadcast-before-resolve ordering is grounded on
//! `mqk-reconcile::engine::reconcile`, which always builds a complete
//! `ReconcileReport` of every mismatch before `gate.rs` decides whether to
//! block on it — generalized from "always report, then gate" into
//! "always broadcast, then resolve". The pluggable `ConflictResolver`
//! callback and its timeout-then-default-strategy fallback have no
//! teacher precedent: `mqk-reconcile` never calls out to a handler, and
//! `tokio::time::timeout` appears nowhere else in the workspace's
//! inspiration sources — this half is a novel addition for the
//! pluggable-resolver requirement spec §4.11 states.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rds_entity::Entity;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Snapshot of a detected divergence between a local and remote version of
/// one entity (spec §3). Immutable once emitted.
#[derive(Clone, Debug)]
pub struct ConflictDetails<T: Entity> {
    pub local: T,
    pub remote: T,
    pub local_ts: DateTime<Utc>,
    pub remote_ts: DateTime<Utc>,
    pub conflicting_fields: Option<Vec<String>>,
}

/// What the resolver (or the default strategy) decided to do (spec §4.11).
#[derive(Clone, Debug)]
pub enum ConflictAction<T: Entity> {
    KeepLocal,
    KeepRemote,
    Merge(T),
    /// Leaves the item conflicted: cache keeps the local value, the
    /// pending change stays marked `last_error = Conflict`.
    Skip,
}

/// Applied when no resolver is configured (spec §4.11).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum DefaultStrategy {
    ServerWins,
    ClientWins,
}

impl DefaultStrategy {
    fn resolve<T: Entity>(self, details: &ConflictDetails<T>) -> ConflictAction<T> {
        match self {
            DefaultStrategy::ServerWins => ConflictAction::KeepRemote,
            DefaultStrategy::ClientWins => ConflictAction::KeepLocal,
        }
    }
}

/// Open callback supplied by the host application. Not virtual-dispatched
/// onto a policy object — spec §7 keeps the policy engine itself a closed,
/// exhaustively matched enum and reserves open dispatch for exactly this
/// seam.
#[async_trait::async_trait]
pub trait ConflictResolver<T: Entity>: Send + Sync {
    async fn resolve(&self, details: &ConflictDetails<T>) -> ConflictAction<T>;
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConflictServiceConfig {
    pub default_strategy: DefaultStrategy,
    /// Resolver/merge callbacks can block indefinitely in user code; after
    /// this elapses the default strategy applies and a warning is logged
    /// (spec §7, "the only place the core guesses intent").
    pub resolver_timeout: Duration,
}

impl Default for ConflictServiceConfig {
    fn default() -> Self {
        Self {
            default_strategy: DefaultStrategy::ServerWins,
            resolver_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ConflictService<T: Entity> {
    config: ConflictServiceConfig,
    resolver: Option<Arc<dyn ConflictResolver<T>>>,
    events_tx: broadcast::Sender<ConflictDetails<T>>,
}

impl<T: Entity> ConflictService<T> {
    pub fn new(config: ConflictServiceConfig, resolver: Option<Arc<dyn ConflictResolver<T>>>) -> Self {
        let (events_tx, _rx) = broadcast::channel(256);
        Self {
            config,
            resolver,
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictDetails<T>> {
        self.events_tx.subscribe()
    }

    /// Emits `details` on the conflicts stream (always, for observability),
    /// then resolves it via the configured resolver, falling back to the
    /// default strategy if none is configured or it times out (spec
    /// §4.11).
    pub async fn handle(&self, details: ConflictDetails<T>) -> ConflictAction<T> {
        let _ = self.events_tx.send(details.clone());

        match &self.resolver {
            Some(resolver) => {
                match timeout(self.config.resolver_timeout, resolver.resolve(&details)).await {
                    Ok(action) => action,
                    Err(_) => {
                        tracing::warn!("conflict resolver timed out, applying default strategy");
                        self.config.default_strategy.resolve(&details)
                    }
                }
            }
            None => self.config.default_strategy.resolve(&details),
        }
    }
}
