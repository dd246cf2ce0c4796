//! In-memory StatusRecord store.
//!
//! The registry is published as an `Arc<RegistryState>` and replaced
//! copy-on-write, so readers (history walks, aggregate recomputes) always
//! see a whole committed state. Commits for one citizen are serialized by
//! that citizen's commit lock; different citizens never share one.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
};

use shared::domain::{Citizen, CitizenId, ResidencyStatus, StatusEvent};

use crate::{
    error::LifecycleError,
    locks::{KeyedGuard, KeyedLocks},
};

#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    citizens: BTreeMap<CitizenId, Citizen>,
    histories: HashMap<CitizenId, Vec<StatusEvent>>,
    version: u64,
}

impl RegistryState {
    /// Bumped on every insert, commit and update.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn citizen(&self, citizen_id: CitizenId) -> Option<&Citizen> {
        self.citizens.get(&citizen_id)
    }

    /// Citizens in id order.
    pub fn citizens(&self) -> impl Iterator<Item = &Citizen> {
        self.citizens.values()
    }

    pub fn history(&self, citizen_id: CitizenId) -> &[StatusEvent] {
        self.histories
            .get(&citizen_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.citizens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.citizens.is_empty()
    }
}

/// A citizen's status events, oldest first, pinned to the registry state
/// it was read from. Iterating it again yields the same events.
#[derive(Debug, Clone)]
pub struct History {
    state: Arc<RegistryState>,
    citizen_id: CitizenId,
}

impl History {
    pub fn citizen_id(&self) -> CitizenId {
        self.citizen_id
    }

    pub fn as_slice(&self) -> &[StatusEvent] {
        self.state.history(self.citizen_id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StatusEvent> {
        self.as_slice().iter()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn to_vec(&self) -> Vec<StatusEvent> {
        self.as_slice().to_vec()
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a StatusEvent;
    type IntoIter = std::slice::Iter<'a, StatusEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Held while a citizen's current state is read, validated and committed.
pub struct CommitGuard {
    guard: KeyedGuard<CitizenId>,
}

impl CommitGuard {
    pub fn citizen_id(&self) -> CitizenId {
        *self.guard.key()
    }
}

#[derive(Default)]
pub struct StatusRecordStore {
    state: RwLock<Arc<RegistryState>>,
    commit_locks: KeyedLocks<CitizenId>,
}

impl StatusRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the store from persisted citizens and their recorded events.
    /// Each citizen's events must form a gap-free chain starting at RESIDENT
    /// and ending in the citizen's current status; a citizen without events
    /// must still be RESIDENT.
    pub fn hydrate(
        citizens: impl IntoIterator<Item = Citizen>,
        events: impl IntoIterator<Item = StatusEvent>,
    ) -> Result<Self, LifecycleError> {
        let mut state = RegistryState::default();
        for citizen in citizens {
            if !citizen.is_consistent() {
                return Err(LifecycleError::InconsistentRecord(citizen.id));
            }
            if state.citizens.contains_key(&citizen.id) {
                return Err(LifecycleError::DuplicateCitizen(citizen.id));
            }
            state.citizens.insert(citizen.id, citizen);
        }

        for event in events {
            if !state.citizens.contains_key(&event.citizen_id) {
                return Err(LifecycleError::NotFound(event.citizen_id));
            }
            state
                .histories
                .entry(event.citizen_id)
                .or_default()
                .push(event);
        }

        for history in state.histories.values_mut() {
            history.sort_by_key(|event| event.sequence);
        }
        for citizen in state.citizens.values() {
            let history = state.histories.get(&citizen.id).map(Vec::as_slice).unwrap_or_default();
            if !chains_to(history, citizen.status) {
                return Err(LifecycleError::InconsistentRecord(citizen.id));
            }
        }

        Ok(Self {
            state: RwLock::new(Arc::new(state)),
            commit_locks: KeyedLocks::default(),
        })
    }

    /// Consistent copy-on-read view of every citizen and history.
    pub fn snapshot(&self) -> Arc<RegistryState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get(&self, citizen_id: CitizenId) -> Result<Citizen, LifecycleError> {
        self.snapshot()
            .citizen(citizen_id)
            .cloned()
            .ok_or(LifecycleError::NotFound(citizen_id))
    }

    pub fn history(&self, citizen_id: CitizenId) -> Result<History, LifecycleError> {
        let state = self.snapshot();
        if state.citizen(citizen_id).is_none() {
            return Err(LifecycleError::NotFound(citizen_id));
        }
        Ok(History { state, citizen_id })
    }

    /// Adds a newly registered citizen. History starts empty.
    pub fn insert(&self, citizen: Citizen) -> Result<(), LifecycleError> {
        if !citizen.is_consistent() {
            return Err(LifecycleError::InconsistentRecord(citizen.id));
        }
        let mut published = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if published.citizens.contains_key(&citizen.id) {
            return Err(LifecycleError::DuplicateCitizen(citizen.id));
        }
        let state = Arc::make_mut(&mut *published);
        state.citizens.insert(citizen.id, citizen);
        state.version += 1;
        Ok(())
    }

    /// Waits for exclusive commit rights on one registered citizen.
    pub async fn lock(&self, citizen_id: CitizenId) -> Result<CommitGuard, LifecycleError> {
        if self.snapshot().citizen(citizen_id).is_none() {
            return Err(LifecycleError::NotFound(citizen_id));
        }
        Ok(CommitGuard {
            guard: self.commit_locks.acquire(citizen_id).await,
        })
    }

    /// Citizens whose commit lock is currently held or awaited.
    pub fn active_commit_locks(&self) -> usize {
        self.commit_locks.len()
    }

    /// Atomically replaces the citizen record and appends its event.
    ///
    /// `citizen.version` must be exactly one past the stored version, and
    /// the event must describe the stored status moving to the new one.
    pub fn commit(&self, citizen: Citizen, event: StatusEvent) -> Result<(), LifecycleError> {
        if !citizen.is_consistent() || event.citizen_id != citizen.id {
            return Err(LifecycleError::InconsistentRecord(citizen.id));
        }

        let mut published = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let stored = published
            .citizens
            .get(&citizen.id)
            .ok_or(LifecycleError::NotFound(citizen.id))?;
        check_version(stored, &citizen)?;

        let next_sequence = published.history(citizen.id).len() as u64 + 1;
        if event.previous_status != stored.status
            || event.new_status != citizen.status
            || event.sequence != next_sequence
        {
            return Err(LifecycleError::InconsistentRecord(citizen.id));
        }

        let state = Arc::make_mut(&mut *published);
        state.histories.entry(citizen.id).or_default().push(event);
        state.citizens.insert(citizen.id, citizen);
        state.version += 1;
        Ok(())
    }

    /// Replaces non-status fields (household, identity) without an event.
    /// Status and detail must be unchanged.
    pub fn update(&self, citizen: Citizen) -> Result<(), LifecycleError> {
        let mut published = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let stored = published
            .citizens
            .get(&citizen.id)
            .ok_or(LifecycleError::NotFound(citizen.id))?;
        check_version(stored, &citizen)?;
        if stored.status != citizen.status || stored.detail != citizen.detail {
            return Err(LifecycleError::InconsistentRecord(citizen.id));
        }

        let state = Arc::make_mut(&mut *published);
        state.citizens.insert(citizen.id, citizen);
        state.version += 1;
        Ok(())
    }
}

/// Sequences run 1..=n, each event starts where the previous one ended, the
/// first starts at RESIDENT and the last ends at `current`.
fn chains_to(history: &[StatusEvent], current: ResidencyStatus) -> bool {
    let mut status = ResidencyStatus::Resident;
    for (index, event) in history.iter().enumerate() {
        if event.sequence != index as u64 + 1 || event.previous_status != status {
            return false;
        }
        status = event.new_status;
    }
    status == current
}

fn check_version(stored: &Citizen, next: &Citizen) -> Result<(), LifecycleError> {
    if next.version != stored.version + 1 {
        return Err(LifecycleError::ConcurrentModification {
            citizen_id: stored.id,
            expected: next.version.saturating_sub(1),
            found: stored.version,
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
