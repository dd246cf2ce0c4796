use std::{collections::BTreeSet, sync::Arc};

use shared::{
    domain::{Actor, Citizen, CitizenId, HouseholdId, ResidencyStatus, StatusEvent},
    protocol::{CacheKey, CitizenUpdate, CommitResult, DetailForm, TransitionPreview},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    aggregates::AggregateCoordinator,
    clock::Clock,
    error::{LifecycleError, ValidationError},
    store::StatusRecordStore,
    validator::{self, is_destructive},
};

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub citizen_id: CitizenId,
    pub target: ResidencyStatus,
    pub detail: DetailForm,
    pub actor: Actor,
    /// Version the caller last saw. When set, any interleaved commit fails
    /// the request instead of being revalidated over.
    pub expected_version: Option<u64>,
}

impl TransitionRequest {
    pub fn new(
        citizen_id: CitizenId,
        target: ResidencyStatus,
        detail: DetailForm,
        actor: Actor,
    ) -> Self {
        Self {
            citizen_id,
            target,
            detail,
            actor,
            expected_version: None,
        }
    }

    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

pub struct LifecycleEngine {
    store: Arc<StatusRecordStore>,
    aggregates: Arc<AggregateCoordinator>,
    clock: Arc<dyn Clock>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<StatusRecordStore>,
        aggregates: Arc<AggregateCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            aggregates,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<StatusRecordStore> {
        &self.store
    }

    pub fn aggregates(&self) -> &Arc<AggregateCoordinator> {
        &self.aggregates
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Registers a new citizen as RESIDENT. Every aggregate counts them.
    pub fn register(&self, citizen: Citizen) -> Result<BTreeSet<CacheKey>, LifecycleError> {
        let citizen_id = citizen.id;
        self.store.insert(citizen)?;
        let keys: BTreeSet<CacheKey> = CacheKey::ALL.into_iter().collect();
        self.aggregates.invalidate(&keys);
        info!(%citizen_id, "citizen registered");
        Ok(keys)
    }

    /// Validates a transition against the stored status without committing.
    pub fn preview(
        &self,
        citizen_id: CitizenId,
        target: ResidencyStatus,
        detail: &DetailForm,
    ) -> Result<TransitionPreview, LifecycleError> {
        let current = self.store.get(citizen_id)?;
        if current.status.is_terminal() {
            return Err(LifecycleError::TerminalState(citizen_id));
        }
        validator::validate(current.status, target, detail)?;
        Ok(TransitionPreview {
            citizen_id,
            from: current.status,
            to: target,
            invalidates: validator::affected_aggregates(current.status, target),
            requires_confirmation: is_destructive(current.status, target),
            version: current.version,
        })
    }

    /// Applies one transition under the citizen's commit lock.
    ///
    /// Dropping the returned future before it completes leaves the registry
    /// untouched; there is no await point between commit and return.
    pub async fn apply_transition(
        &self,
        request: &TransitionRequest,
    ) -> Result<CommitResult, LifecycleError> {
        ensure_actor(&request.actor)?;
        let _guard = self.store.lock(request.citizen_id).await?;

        let current = self.store.get(request.citizen_id)?;
        if current.status.is_terminal() {
            warn!(citizen_id = %current.id, target = %request.target, "transition out of terminal state refused");
            return Err(LifecycleError::TerminalState(current.id));
        }
        if let Some(expected) = request.expected_version {
            if expected != current.version {
                return Err(LifecycleError::ConcurrentModification {
                    citizen_id: current.id,
                    expected,
                    found: current.version,
                });
            }
        }

        let validated = validator::validate(current.status, request.target, &request.detail)
            .map_err(|error| {
                warn!(citizen_id = %current.id, from = %current.status, to = %request.target, %error, "transition rejected");
                error
            })?;

        let sequence = self.store.history(current.id)?.len() as u64 + 1;
        let mut next = current.clone();
        next.status = validated.to;
        next.detail = validated.detail;
        next.version = current.version + 1;

        let event = StatusEvent {
            event_id: Uuid::new_v4(),
            citizen_id: current.id,
            sequence,
            previous_status: validated.from,
            new_status: validated.to,
            detail: next.detail.clone(),
            recorded_at: self.clock.now(),
            actor: request.actor.clone(),
        };

        self.store.commit(next.clone(), event.clone())?;
        let invalidated = self.aggregates.on_commit(&event);
        info!(
            citizen_id = %current.id,
            from = %event.previous_status,
            to = %event.new_status,
            sequence = event.sequence,
            actor = %event.actor,
            "status transition committed"
        );

        Ok(CommitResult {
            citizen: next,
            event,
            invalidated,
        })
    }

    /// Reassigns a living citizen to another household. No status event is
    /// recorded; per-household fee liability changes, so `fee-stats` is
    /// invalidated.
    pub async fn move_household(
        &self,
        citizen_id: CitizenId,
        household_id: HouseholdId,
        actor: &Actor,
    ) -> Result<(Citizen, BTreeSet<CacheKey>), LifecycleError> {
        ensure_actor(actor)?;
        let _guard = self.store.lock(citizen_id).await?;

        let current = self.store.get(citizen_id)?;
        if current.status.is_terminal() {
            return Err(LifecycleError::TerminalState(citizen_id));
        }
        if current.household_id == household_id {
            return Ok((current, BTreeSet::new()));
        }

        let mut next = current.clone();
        next.household_id = household_id;
        next.version = current.version + 1;
        self.store.update(next.clone())?;

        let keys = BTreeSet::from([CacheKey::FeeStats]);
        self.aggregates.invalidate(&keys);
        info!(
            %citizen_id,
            from = %current.household_id,
            to = %household_id,
            %actor,
            "citizen moved household"
        );
        Ok((next, keys))
    }

    /// Corrects identity fields of a living citizen. No status event is
    /// recorded. A new gender invalidates `gender-stats`; a new birth date
    /// invalidates `age-stats`.
    pub async fn update_identity(
        &self,
        citizen_id: CitizenId,
        update: &CitizenUpdate,
    ) -> Result<(Citizen, BTreeSet<CacheKey>), LifecycleError> {
        ensure_actor(&update.actor)?;
        let _guard = self.store.lock(citizen_id).await?;

        let current = self.store.get(citizen_id)?;
        if current.status.is_terminal() {
            return Err(LifecycleError::TerminalState(citizen_id));
        }
        if let Some(expected) = update.expected_version {
            if expected != current.version {
                return Err(LifecycleError::ConcurrentModification {
                    citizen_id,
                    expected,
                    found: current.version,
                });
            }
        }

        let mut next = current.clone();
        if let Some(name) = &update.full_name {
            next.full_name = required_text("full_name", name)?;
        }
        if let Some(national_id) = &update.national_id {
            let national_id = required_text("national_id", national_id)?;
            let taken = self
                .store
                .snapshot()
                .citizens()
                .any(|c| c.id != citizen_id && c.national_id == national_id);
            if taken {
                return Err(LifecycleError::NationalIdTaken(national_id));
            }
            next.national_id = national_id;
        }
        if let Some(birth_date) = update.birth_date {
            if birth_date > self.clock.today() {
                return Err(ValidationError::MalformedField {
                    field: "birth_date".into(),
                    reason: format!("{birth_date} is in the future"),
                }
                .into());
            }
            next.birth_date = birth_date;
        }
        if let Some(gender) = update.gender {
            next.gender = gender;
        }
        if next == current {
            return Ok((current, BTreeSet::new()));
        }

        next.version = current.version + 1;
        self.store.update(next.clone())?;

        let mut keys = BTreeSet::new();
        if next.gender != current.gender {
            keys.insert(CacheKey::GenderStats);
        }
        if next.birth_date != current.birth_date {
            keys.insert(CacheKey::AgeStats);
        }
        self.aggregates.invalidate(&keys);
        info!(%citizen_id, actor = %update.actor, version = next.version, "citizen identity updated");
        Ok((next, keys))
    }
}

fn required_text(field: &str, value: &str) -> Result<String, LifecycleError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingField(field.into()).into());
    }
    Ok(value.to_string())
}

fn ensure_actor(actor: &Actor) -> Result<(), LifecycleError> {
    if actor.as_str().trim().is_empty() {
        return Err(ValidationError::MissingField("actor".into()).into());
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
