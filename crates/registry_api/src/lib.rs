use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Context;
use lifecycle::{
    hydrate_from, AggregateConfig, AggregateError, Clock, KeyedGuard, KeyedLocks,
    LifecycleEngine, LifecycleError, RegistryBackend, TransitionRequest, ValidationError,
};
use shared::{
    domain::{
        Citizen, CitizenId, FeePeriod, FeePeriodId, FeeRecord, FeeRecordId, Household,
        HouseholdId, PaymentStatus, StatusEvent,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AggregateSnapshot, CacheKey, CitizenQuery, CitizenUpdate, CitizenUpdateReceipt,
        FeeRecordQuery, HouseholdMoveRequest, HouseholdSummary, NewCitizen, NewFeePeriod,
        NewFeeRecord, NewHousehold, Page, PreviewRequestBody, RegistryEvent, TransitionPreview,
        TransitionReceipt, TransitionRequestBody, UnpaidHousehold,
    },
};
use storage::{is_unique_violation, Storage};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// A committed change the mirror has not accepted yet.
#[derive(Debug, Clone)]
enum PendingWrite {
    Transition { citizen: Citizen, event: StatusEvent },
    Citizen(Citizen),
}

impl PendingWrite {
    fn citizen_id(&self) -> CitizenId {
        match self {
            PendingWrite::Transition { citizen, .. } | PendingWrite::Citizen(citizen) => citizen.id,
        }
    }

    async fn send(&self, mirror: &dyn RegistryBackend) -> anyhow::Result<()> {
        match self {
            PendingWrite::Transition { citizen, event } => {
                mirror.record_transition(citizen, event).await
            }
            PendingWrite::Citizen(citizen) => mirror.record_citizen_update(citizen).await,
        }
    }
}

type Outbox = Arc<Mutex<HashMap<CitizenId, VecDeque<PendingWrite>>>>;

#[derive(Clone)]
pub struct RegistryContext {
    pub storage: Storage,
    /// Receives every committed change after the in-memory registry has it.
    pub mirror: Arc<dyn RegistryBackend>,
    pub engine: Arc<LifecycleEngine>,
    events: broadcast::Sender<RegistryEvent>,
    write_order: Arc<KeyedLocks<CitizenId>>,
    identity_claims: Arc<KeyedLocks<String>>,
    outbox: Outbox,
}

impl RegistryContext {
    pub fn new(
        storage: Storage,
        mirror: Arc<dyn RegistryBackend>,
        engine: Arc<LifecycleEngine>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            storage,
            mirror,
            engine,
            events,
            write_order: Arc::default(),
            identity_claims: Arc::default(),
            outbox: Arc::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Committed writes still waiting for the mirror.
    pub fn pending_writes(&self) -> usize {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_invalidated(&self, keys: &BTreeSet<CacheKey>) {
        if !keys.is_empty() {
            self.publish(RegistryEvent::AggregatesInvalidated { keys: keys.clone() });
        }
    }

    /// Keeps one citizen's mirror writes in commit order. Anything queued
    /// for the citizen is replayed first; a new write is refused while the
    /// queue cannot drain.
    async fn write_slot(&self, citizen_id: CitizenId) -> Result<KeyedGuard<CitizenId>, ApiError> {
        self.engine.store().get(citizen_id).map_err(lifecycle_error)?;
        let slot = self.write_order.acquire(citizen_id).await;
        if let Err(err) = self.drain(citizen_id).await {
            error!(%citizen_id, error = %format!("{err:#}"), "queued writes still failing");
            return Err(ApiError::new(
                ErrorCode::Internal,
                format!("earlier changes of citizen {citizen_id} are not persisted yet"),
            ));
        }
        Ok(slot)
    }

    /// Replays the citizen's queue front to back. Caller holds the write slot.
    async fn drain(&self, citizen_id: CitizenId) -> anyhow::Result<()> {
        loop {
            let next = self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&citizen_id)
                .and_then(|queue| queue.front().cloned());
            let Some(write) = next else {
                return Ok(());
            };
            write.send(self.mirror.as_ref()).await?;

            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = outbox.get_mut(&citizen_id) {
                queue.pop_front();
                if queue.is_empty() {
                    outbox.remove(&citizen_id);
                }
            }
            info!(%citizen_id, "queued write persisted");
        }
    }

    /// Sends a fresh commit to the mirror, queueing it on failure.
    /// Caller holds the write slot, so the queue is empty on entry.
    async fn mirror_or_queue(&self, write: PendingWrite, what: &str) -> bool {
        let citizen_id = write.citizen_id();
        let sent = write.send(self.mirror.as_ref()).await;
        match sent {
            Ok(()) => true,
            Err(err) => {
                error!(%citizen_id, error = %format!("{err:#}"), "failed to persist {what}");
                self.publish(RegistryEvent::Error(ApiError::new(
                    ErrorCode::Internal,
                    format!("{what} of citizen {citizen_id} is committed but not persisted"),
                )));
                self.outbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(citizen_id)
                    .or_default()
                    .push_back(write);
                false
            }
        }
    }
}

/// Hydrates the lifecycle core from storage and mirrors commits back into it.
pub async fn bootstrap(
    storage: Storage,
    clock: Arc<dyn Clock>,
    config: AggregateConfig,
) -> anyhow::Result<RegistryContext> {
    let engine = hydrate_from(&storage, clock, config)
        .await
        .context("failed to hydrate registry from storage")?;
    let state = engine.store().snapshot();
    info!(
        citizens = state.len(),
        registry_version = state.version(),
        "registry hydrated"
    );
    let mirror: Arc<dyn RegistryBackend> = Arc::new(storage.clone());
    Ok(RegistryContext::new(storage, mirror, Arc::new(engine)))
}

/// Retries every queued mirror write. Returns how many are still queued.
pub async fn flush_pending_writes(ctx: &RegistryContext) -> usize {
    let citizens: Vec<CitizenId> = ctx
        .outbox
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .copied()
        .collect();
    for citizen_id in citizens {
        let _slot = ctx.write_order.acquire(citizen_id).await;
        if let Err(err) = ctx.drain(citizen_id).await {
            warn!(%citizen_id, error = %format!("{err:#}"), "queued writes still failing");
        }
    }
    ctx.pending_writes()
}

pub async fn health(ctx: &RegistryContext) -> Result<(), ApiError> {
    ctx.storage.health_check().await.map_err(internal)
}

pub async fn request_transition(
    ctx: &RegistryContext,
    citizen_id: CitizenId,
    body: TransitionRequestBody,
) -> Result<TransitionReceipt, ApiError> {
    let _slot = ctx.write_slot(citizen_id).await?;
    let mut request = TransitionRequest::new(citizen_id, body.target, body.detail, body.actor);
    request.expected_version = body.expected_version;
    let commit = ctx
        .engine
        .apply_transition(&request)
        .await
        .map_err(lifecycle_error)?;

    let write = PendingWrite::Transition {
        citizen: commit.citizen.clone(),
        event: commit.event.clone(),
    };
    let what = format!("transition {}", commit.event.sequence);
    let persisted = ctx.mirror_or_queue(write, &what).await;

    ctx.publish(RegistryEvent::StatusChanged {
        event: commit.event.clone(),
    });
    ctx.publish_invalidated(&commit.invalidated);
    Ok(TransitionReceipt { commit, persisted })
}

pub fn preview_transition(
    ctx: &RegistryContext,
    citizen_id: CitizenId,
    body: &PreviewRequestBody,
) -> Result<TransitionPreview, ApiError> {
    ctx.engine
        .preview(citizen_id, body.target, &body.detail)
        .map_err(lifecycle_error)
}

pub fn get_current_status(ctx: &RegistryContext, citizen_id: CitizenId) -> Result<Citizen, ApiError> {
    ctx.engine.store().get(citizen_id).map_err(lifecycle_error)
}

pub fn get_history(
    ctx: &RegistryContext,
    citizen_id: CitizenId,
) -> Result<Vec<StatusEvent>, ApiError> {
    ctx.engine
        .store()
        .history(citizen_id)
        .map(|history| history.to_vec())
        .map_err(lifecycle_error)
}

pub fn get_aggregate(ctx: &RegistryContext, key: CacheKey) -> Result<AggregateSnapshot, ApiError> {
    ctx.engine
        .aggregates()
        .get_snapshot(key)
        .map(|snapshot| (*snapshot).clone())
        .map_err(|err| aggregate_error(key, err))
}

/// Filters the registry by name/ID text, status and household, then pages
/// the result in citizen-id order. An empty query lists everyone.
pub fn list_citizens(ctx: &RegistryContext, query: &CitizenQuery) -> Result<Page<Citizen>, ApiError> {
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page == 0 {
        return Err(ApiError::new(ErrorCode::Validation, "page starts at 1"));
    }
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("page_size must be between 1 and {MAX_PAGE_SIZE}"),
        ));
    }

    let needle = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_lowercase);
    let state = ctx.engine.store().snapshot();
    let matches: Vec<&Citizen> = state
        .citizens()
        .filter(|c| query.status.map_or(true, |status| c.status == status))
        .filter(|c| query.household_id.map_or(true, |id| c.household_id.0 == id))
        .filter(|c| {
            needle.as_deref().map_or(true, |needle| {
                c.full_name.to_lowercase().contains(needle) || c.national_id.contains(needle)
            })
        })
        .collect();

    let skip = (page as usize - 1) * page_size as usize;
    Ok(Page {
        total: matches.len() as u64,
        items: matches
            .into_iter()
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect(),
        page,
        page_size,
    })
}

pub async fn register_citizen(ctx: &RegistryContext, new: NewCitizen) -> Result<Citizen, ApiError> {
    require("full_name", &new.full_name)?;
    require("national_id", &new.national_id)?;
    let today = ctx.engine.clock().today();
    if new.birth_date > today {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("birth_date {} is in the future", new.birth_date),
        ));
    }
    ensure_household(ctx, new.household_id).await?;
    let _claim = ctx.identity_claims.acquire(new.national_id.clone()).await;
    let state = ctx.engine.store().snapshot();
    if state.citizens().any(|c| c.national_id == new.national_id) {
        return Err(national_id_taken(&new.national_id));
    }

    let citizen = ctx.storage.create_citizen(&new).await.map_err(|err| {
        if is_unique_violation(&err) {
            national_id_taken(&new.national_id)
        } else {
            internal(err)
        }
    })?;
    let keys = ctx
        .engine
        .register(citizen.clone())
        .map_err(lifecycle_error)?;
    ctx.publish_invalidated(&keys);
    Ok(citizen)
}

pub async fn move_household(
    ctx: &RegistryContext,
    citizen_id: CitizenId,
    body: HouseholdMoveRequest,
) -> Result<CitizenUpdateReceipt, ApiError> {
    ensure_household(ctx, body.household_id).await?;
    let _slot = ctx.write_slot(citizen_id).await?;
    let (citizen, invalidated) = ctx
        .engine
        .move_household(citizen_id, body.household_id, &body.actor)
        .await
        .map_err(lifecycle_error)?;
    if invalidated.is_empty() {
        return Ok(CitizenUpdateReceipt {
            citizen,
            invalidated,
            persisted: true,
        });
    }

    let persisted = ctx
        .mirror_or_queue(PendingWrite::Citizen(citizen.clone()), "household move")
        .await;
    ctx.publish(RegistryEvent::HouseholdChanged {
        citizen_id,
        household_id: citizen.household_id,
    });
    ctx.publish_invalidated(&invalidated);
    Ok(CitizenUpdateReceipt {
        citizen,
        invalidated,
        persisted,
    })
}

/// Corrects name, birth date, national ID or gender. Status stays with the
/// transition path.
pub async fn update_citizen(
    ctx: &RegistryContext,
    citizen_id: CitizenId,
    update: CitizenUpdate,
) -> Result<CitizenUpdateReceipt, ApiError> {
    let _claim = match update.national_id.as_deref() {
        Some(national_id) => Some(ctx.identity_claims.acquire(national_id.trim().to_owned()).await),
        None => None,
    };
    let _slot = ctx.write_slot(citizen_id).await?;
    let before = ctx.engine.store().get(citizen_id).map_err(lifecycle_error)?;
    let (citizen, invalidated) = ctx
        .engine
        .update_identity(citizen_id, &update)
        .await
        .map_err(lifecycle_error)?;
    if citizen.version == before.version {
        return Ok(CitizenUpdateReceipt {
            citizen,
            invalidated,
            persisted: true,
        });
    }

    let persisted = ctx
        .mirror_or_queue(PendingWrite::Citizen(citizen.clone()), "identity update")
        .await;
    ctx.publish(RegistryEvent::CitizenUpdated {
        citizen: citizen.clone(),
    });
    ctx.publish_invalidated(&invalidated);
    Ok(CitizenUpdateReceipt {
        citizen,
        invalidated,
        persisted,
    })
}

pub async fn create_household(
    ctx: &RegistryContext,
    new: NewHousehold,
) -> Result<Household, ApiError> {
    require("code", &new.code)?;
    require("head_name", &new.head_name)?;
    require("address", &new.address)?;
    let households = ctx.storage.list_households().await.map_err(internal)?;
    if households.iter().any(|h| h.code == new.code) {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            format!("household code {} already exists", new.code),
        ));
    }

    let household = ctx.storage.create_household(&new).await.map_err(|err| {
        if is_unique_violation(&err) {
            ApiError::new(
                ErrorCode::Conflict,
                format!("household code {} already exists", new.code),
            )
        } else {
            internal(err)
        }
    })?;
    refresh_fee_ledger(ctx).await?;
    info!(household_id = %household.id, code = %household.code, "household created");
    Ok(household)
}

/// Households with their count of living members.
pub async fn list_households(ctx: &RegistryContext) -> Result<Vec<HouseholdSummary>, ApiError> {
    let households = ctx.storage.list_households().await.map_err(internal)?;
    let state = ctx.engine.store().snapshot();
    let mut members = HashMap::new();
    for citizen in state.citizens().filter(|c| c.status.is_living()) {
        *members.entry(citizen.household_id).or_insert(0u64) += 1;
    }
    Ok(households
        .into_iter()
        .map(|household| HouseholdSummary {
            member_count: members.get(&household.id).copied().unwrap_or(0),
            household,
        })
        .collect())
}

pub async fn create_fee_period(
    ctx: &RegistryContext,
    new: NewFeePeriod,
) -> Result<FeePeriod, ApiError> {
    require("name", &new.name)?;
    if new.amount_per_member < 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "amount_per_member must not be negative",
        ));
    }
    if let Some(ends_on) = new.ends_on {
        if ends_on < new.starts_on {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("period ends {ends_on} before it starts {}", new.starts_on),
            ));
        }
    }

    let period = ctx.storage.create_fee_period(&new).await.map_err(internal)?;
    refresh_fee_ledger(ctx).await?;
    Ok(period)
}

pub async fn list_fee_periods(ctx: &RegistryContext) -> Result<Vec<FeePeriod>, ApiError> {
    ctx.storage.list_fee_periods().await.map_err(internal)
}

pub async fn record_fee(ctx: &RegistryContext, new: NewFeeRecord) -> Result<FeeRecord, ApiError> {
    check_fee_record(ctx, &new).await?;
    let record = ctx.storage.insert_fee_record(&new).await.map_err(internal)?;
    refresh_fee_ledger(ctx).await?;
    info!(
        record_id = %record.id,
        household_id = %record.household_id,
        period_id = %record.period_id,
        status = record.status.as_str(),
        "fee recorded"
    );
    Ok(record)
}

pub async fn update_fee_record(
    ctx: &RegistryContext,
    record_id: FeeRecordId,
    changes: NewFeeRecord,
) -> Result<FeeRecord, ApiError> {
    check_fee_record(ctx, &changes).await?;
    let record = ctx
        .storage
        .update_fee_record(record_id, &changes)
        .await
        .map_err(internal)?
        .ok_or_else(|| fee_record_missing(record_id))?;
    refresh_fee_ledger(ctx).await?;
    info!(%record_id, status = record.status.as_str(), "fee record updated");
    Ok(record)
}

pub async fn delete_fee_record(ctx: &RegistryContext, record_id: FeeRecordId) -> Result<(), ApiError> {
    if !ctx
        .storage
        .delete_fee_record(record_id)
        .await
        .map_err(internal)?
    {
        return Err(fee_record_missing(record_id));
    }
    refresh_fee_ledger(ctx).await?;
    info!(%record_id, "fee record deleted");
    Ok(())
}

pub async fn list_fee_records(
    ctx: &RegistryContext,
    query: &FeeRecordQuery,
) -> Result<Vec<FeeRecord>, ApiError> {
    ctx.storage.list_fee_records(query).await.map_err(internal)
}

/// Households with living members and no PAID record for the period,
/// with what each owes.
pub async fn unpaid_households(
    ctx: &RegistryContext,
    period_id: FeePeriodId,
) -> Result<Vec<UnpaidHousehold>, ApiError> {
    let period = ctx
        .storage
        .fee_period(period_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| fee_period_missing(period_id))?;
    let ledger = ctx.storage.fee_ledger().await.map_err(internal)?;
    let state = ctx.engine.store().snapshot();
    lifecycle::unpaid_households(&state, &ledger, &period).map_err(|err| {
        warn!(%period_id, %err, "unpaid households unavailable");
        ApiError::new(
            ErrorCode::Internal,
            format!("unpaid households of period {period_id} unavailable: {err}"),
        )
    })
}

async fn check_fee_record(ctx: &RegistryContext, new: &NewFeeRecord) -> Result<(), ApiError> {
    if new.amount_paid < 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "amount_paid must not be negative",
        ));
    }
    if new.status == PaymentStatus::Paid && new.collected_on.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "collected_on is required for a paid record",
        ));
    }
    ensure_household(ctx, new.household_id).await?;
    if ctx
        .storage
        .fee_period(new.period_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(fee_period_missing(new.period_id));
    }
    Ok(())
}

async fn refresh_fee_ledger(ctx: &RegistryContext) -> Result<(), ApiError> {
    let ledger = ctx.storage.fee_ledger().await.map_err(internal)?;
    let keys = ctx.engine.aggregates().replace_fee_ledger(ledger);
    ctx.publish_invalidated(&keys);
    Ok(())
}

async fn ensure_household(
    ctx: &RegistryContext,
    household_id: HouseholdId,
) -> Result<(), ApiError> {
    ctx.storage
        .household(household_id)
        .await
        .map_err(internal)?
        .map(|_| ())
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::NotFound,
                format!("household {household_id} not found"),
            )
        })
}

fn fee_period_missing(period_id: FeePeriodId) -> ApiError {
    ApiError::new(
        ErrorCode::NotFound,
        format!("fee period {period_id} not found"),
    )
}

fn fee_record_missing(record_id: FeeRecordId) -> ApiError {
    ApiError::new(
        ErrorCode::NotFound,
        format!("fee record {record_id} not found"),
    )
}

fn national_id_taken(national_id: &str) -> ApiError {
    ApiError::new(
        ErrorCode::Conflict,
        format!("national_id {national_id} is already registered"),
    )
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("missing required field '{field}'"),
        ));
    }
    Ok(())
}

pub fn lifecycle_error(err: LifecycleError) -> ApiError {
    let code = match &err {
        LifecycleError::Validation(ValidationError::InvalidTransition { .. }) => {
            ErrorCode::InvalidTransition
        }
        LifecycleError::Validation(_) => ErrorCode::Validation,
        LifecycleError::TerminalState(_) => ErrorCode::TerminalState,
        LifecycleError::NotFound(_) => ErrorCode::NotFound,
        LifecycleError::ConcurrentModification { .. }
        | LifecycleError::DuplicateCitizen(_)
        | LifecycleError::NationalIdTaken(_) => ErrorCode::Conflict,
        LifecycleError::InconsistentRecord(_) => ErrorCode::Internal,
    };
    ApiError::new(code, err.to_string())
}

fn aggregate_error(key: CacheKey, err: AggregateError) -> ApiError {
    warn!(%key, %err, "aggregate unavailable");
    ApiError::new(ErrorCode::Internal, format!("{key} unavailable: {err}"))
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "registry operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
