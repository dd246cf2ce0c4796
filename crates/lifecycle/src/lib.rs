//! Residency-status lifecycle core: transition validation, the citizen
//! status store, the engine that commits transitions, and the aggregate
//! statistics that depend on them.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{Citizen, StatusEvent};

pub mod aggregates;
pub mod clock;
pub mod engine;
pub mod error;
pub mod locks;
pub mod store;
pub mod validator;

pub use aggregates::{unpaid_households, AggregateConfig, AggregateCoordinator, FeeLedger};
pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{LifecycleEngine, TransitionRequest};
pub use error::{AggregateError, LifecycleError, ValidationError};
pub use locks::{KeyedGuard, KeyedLocks};
pub use store::{History, RegistryState, StatusRecordStore};

/// Everything needed to rebuild the in-memory registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryImage {
    pub citizens: Vec<Citizen>,
    pub events: Vec<StatusEvent>,
}

/// Persistence collaborator. Loads are awaited before the core starts;
/// writes mirror commits that already happened in memory and must accept
/// a write that was already applied.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn load_registry(&self) -> Result<RegistryImage>;
    async fn load_fee_ledger(&self) -> Result<FeeLedger>;
    async fn record_transition(&self, citizen: &Citizen, event: &StatusEvent) -> Result<()>;
    /// Household and identity fields of an evented citizen.
    async fn record_citizen_update(&self, citizen: &Citizen) -> Result<()>;
}

/// Loads a backend's registry and fee ledger into a ready-to-use store,
/// coordinator and engine.
pub async fn hydrate_from(
    backend: &dyn RegistryBackend,
    clock: Arc<dyn Clock>,
    config: AggregateConfig,
) -> Result<LifecycleEngine> {
    let image = backend
        .load_registry()
        .await
        .context("failed to load citizen registry")?;
    let ledger = backend
        .load_fee_ledger()
        .await
        .context("failed to load fee ledger")?;

    let store = Arc::new(
        StatusRecordStore::hydrate(image.citizens, image.events)
            .context("persisted registry is inconsistent")?,
    );
    let aggregates = Arc::new(AggregateCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config,
        ledger,
    ));
    Ok(LifecycleEngine::new(store, aggregates, clock))
}
