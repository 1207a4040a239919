//! rds-store
//!
//! The public façade (spec §4.12, C12): wires the cache, pending queue,
//! reactive registry, policy engine, conflict service, and circuit breaker
//! into one `Store<T>` per entity type. Everything upstream of this crate
//! is a closed component with its own narrow contract; this is the only
//! crate a host application depends on directly.

pub mod config;
mod health;
mod pool_metrics;
mod store;

pub use config::{ErrorSink, RetryConfig, StoreConfig, TracingErrorSink};
pub use pool_metrics::PoolMetricsSource;
pub use store::Store;

pub use rds_backend::{Backend, BackendCapabilities, CompositeBackend, CompositeReadStrategy, CompositeWriteStrategy, HealthStatus, SyncStatus};
pub use rds_conflict::{ConflictAction, ConflictDetails, ConflictResolver, DefaultStrategy};
pub use rds_entity::{Entity, FieldValue, ValueMap};
pub use rds_error::{StoreError, StoreResult};
pub use rds_pagination::PaginationState;
pub use rds_pending::{ChangeId, ChangeOp, PendingChange};
pub use rds_policy::{FetchPolicy, WritePolicy};
pub use rds_query::Query;
pub use rds_reactive::{IdWatch, QueryWatch};
