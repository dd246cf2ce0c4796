//! Aggregate recompute coordinator.
//!
//! Snapshots are cached per key until a commit invalidates them and are then
//! rebuilt lazily with a full fold over a registry snapshot. Each key fails
//! on its own: a broken fee ledger only breaks `fee-stats`.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use chrono::{Datelike, NaiveDate};
use shared::{
    domain::{
        FeePeriod, FeeRecord, FeePeriodId, Gender, Household, HouseholdId, PaymentStatus,
        StatusEvent,
    },
    protocol::{
        AgeStats, AggregateData, AggregateSnapshot, CacheKey, FeeStats, GenderStats,
        UnpaidHousehold,
    },
};
use tracing::debug;

use crate::{
    clock::Clock, error::AggregateError, store::RegistryState, store::StatusRecordStore,
    validator::affected_aggregates,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateConfig {
    pub child_age_threshold: u32,
    pub retirement_age: u32,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            child_age_threshold: 18,
            retirement_age: 60,
        }
    }
}

/// Fee-collection data read from persistence. Read-only to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeLedger {
    pub households: Vec<Household>,
    pub periods: Vec<FeePeriod>,
    pub records: Vec<FeeRecord>,
}

#[derive(Default)]
struct CacheSlot {
    generation: u64,
    snapshot: Option<Arc<AggregateSnapshot>>,
}

pub struct AggregateCoordinator {
    store: Arc<StatusRecordStore>,
    clock: Arc<dyn Clock>,
    config: AggregateConfig,
    ledger: RwLock<Arc<FeeLedger>>,
    slots: Mutex<HashMap<CacheKey, CacheSlot>>,
}

impl AggregateCoordinator {
    pub fn new(
        store: Arc<StatusRecordStore>,
        clock: Arc<dyn Clock>,
        config: AggregateConfig,
        ledger: FeeLedger,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            ledger: RwLock::new(Arc::new(ledger)),
            slots: Mutex::default(),
        }
    }

    pub fn config(&self) -> AggregateConfig {
        self.config
    }

    /// Invalidates whatever the committed event affects and returns those keys.
    pub fn on_commit(&self, event: &StatusEvent) -> BTreeSet<CacheKey> {
        let keys = affected_aggregates(event.previous_status, event.new_status);
        self.invalidate(&keys);
        keys
    }

    pub fn invalidate(&self, keys: &BTreeSet<CacheKey>) {
        if keys.is_empty() {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            let slot = slots.entry(*key).or_default();
            slot.generation += 1;
            slot.snapshot = None;
        }
        debug!(?keys, "aggregates invalidated");
    }

    /// Swaps in fresh fee data; `fee-stats` is invalidated.
    pub fn replace_fee_ledger(&self, ledger: FeeLedger) -> BTreeSet<CacheKey> {
        *self.ledger.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ledger);
        let keys = BTreeSet::from([CacheKey::FeeStats]);
        self.invalidate(&keys);
        keys
    }

    pub fn fee_ledger(&self) -> Arc<FeeLedger> {
        Arc::clone(&self.ledger.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Cached snapshot for `key`, recomputed first if it was invalidated.
    pub fn get_snapshot(&self, key: CacheKey) -> Result<Arc<AggregateSnapshot>, AggregateError> {
        let generation = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = slots.entry(key).or_default();
            if let Some(snapshot) = &slot.snapshot {
                return Ok(Arc::clone(snapshot));
            }
            slot.generation
        };

        let state = self.store.snapshot();
        let computed_at = self.clock.now();
        let data = match key {
            CacheKey::GenderStats => AggregateData::Gender(gender_stats(&state)),
            CacheKey::AgeStats => AggregateData::Age(age_stats(
                &state,
                computed_at.date_naive(),
                self.config,
            )),
            CacheKey::FeeStats => AggregateData::Fee(fee_stats(&state, &self.fee_ledger())?),
        };
        let snapshot = Arc::new(AggregateSnapshot {
            key,
            computed_at,
            registry_version: state.version(),
            data,
        });
        debug!(%key, registry_version = state.version(), "aggregate recomputed");

        // A commit that landed mid-fold bumped the generation; the result is
        // still returned but not cached.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key).or_default();
        if slot.generation == generation {
            slot.snapshot = Some(Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }
}

pub fn gender_stats(state: &RegistryState) -> GenderStats {
    state
        .citizens()
        .filter(|citizen| citizen.status.is_living())
        .fold(GenderStats::default(), |mut stats, citizen| {
            match citizen.gender {
                Gender::Male => stats.male += 1,
                Gender::Female => stats.female += 1,
            }
            stats
        })
}

pub fn age_stats(state: &RegistryState, today: NaiveDate, config: AggregateConfig) -> AgeStats {
    let mut stats = AgeStats {
        child_age_threshold: config.child_age_threshold,
        retirement_age: config.retirement_age,
        ..AgeStats::default()
    };
    for citizen in state.citizens().filter(|c| c.status.is_living()) {
        let age = age_on(citizen.birth_date, today);
        if age < config.child_age_threshold {
            stats.children += 1;
        } else if age < config.retirement_age {
            stats.working += 1;
        } else {
            stats.retired += 1;
        }
    }
    stats
}

/// Completed years between `birth_date` and `today`; zero for future births.
pub fn age_on(birth_date: NaiveDate, today: NaiveDate) -> u32 {
    let mut years = today.year() - birth_date.year();
    if (today.month(), today.day()) < (birth_date.month(), birth_date.day()) {
        years -= 1;
    }
    u32::try_from(years).unwrap_or(0)
}

fn living_members(state: &RegistryState) -> HashMap<HouseholdId, u64> {
    let mut members: HashMap<HouseholdId, u64> = HashMap::new();
    for citizen in state.citizens().filter(|c| c.status.is_living()) {
        *members.entry(citizen.household_id).or_default() += 1;
    }
    members
}

/// Households with living members that have no PAID record for `period`,
/// in ledger order. Uses the same liability rule as `fee-stats`.
pub fn unpaid_households(
    state: &RegistryState,
    ledger: &FeeLedger,
    period: &FeePeriod,
) -> Result<Vec<UnpaidHousehold>, AggregateError> {
    let members = living_members(state);
    let paid: HashSet<HouseholdId> = ledger
        .records
        .iter()
        .filter(|r| r.period_id == period.id && r.status == PaymentStatus::Paid)
        .map(|r| r.household_id)
        .collect();

    let mut unpaid = Vec::new();
    for household in &ledger.households {
        let living = members.get(&household.id).copied().unwrap_or(0);
        if living == 0 || paid.contains(&household.id) {
            continue;
        }
        let amount_due = i64::try_from(living)
            .ok()
            .and_then(|living| period.amount_per_member.checked_mul(living))
            .ok_or(AggregateError::Overflow("amount_due"))?;
        unpaid.push(UnpaidHousehold {
            household: household.clone(),
            period_id: period.id,
            living_members: living,
            amount_due,
        });
    }
    Ok(unpaid)
}

pub fn fee_stats(state: &RegistryState, ledger: &FeeLedger) -> Result<FeeStats, AggregateError> {
    let living_members = living_members(state);

    let households: HashSet<HouseholdId> = ledger.households.iter().map(|h| h.id).collect();
    let periods: HashMap<FeePeriodId, &FeePeriod> =
        ledger.periods.iter().map(|p| (p.id, p)).collect();

    let mut total_collected: i64 = 0;
    let mut paid_pairs: HashSet<(FeePeriodId, HouseholdId)> = HashSet::new();
    for record in &ledger.records {
        check_fee_record(record, &periods, &households)?;
        if record.status == PaymentStatus::Paid {
            total_collected = total_collected
                .checked_add(record.amount_paid)
                .ok_or(AggregateError::Overflow("total_collected"))?;
            paid_pairs.insert((record.period_id, record.household_id));
        }
    }

    let mut total_required: i64 = 0;
    let mut households_paid = 0;
    let mut households_unpaid = 0;
    for period in &ledger.periods {
        for household in &ledger.households {
            let members = living_members.get(&household.id).copied().unwrap_or(0);
            if members == 0 {
                continue;
            }
            let owed = i64::try_from(members)
                .ok()
                .and_then(|members| period.amount_per_member.checked_mul(members))
                .ok_or(AggregateError::Overflow("total_required"))?;
            total_required = total_required
                .checked_add(owed)
                .ok_or(AggregateError::Overflow("total_required"))?;
            if paid_pairs.contains(&(period.id, household.id)) {
                households_paid += 1;
            } else {
                households_unpaid += 1;
            }
        }
    }

    let collection_rate_bp = if total_required > 0 {
        let rate = i128::from(total_collected) * 10_000 / i128::from(total_required);
        u64::try_from(rate).unwrap_or(0)
    } else {
        0
    };

    Ok(FeeStats {
        total_required,
        total_collected,
        collection_rate_bp,
        households_paid,
        households_unpaid,
        liable_members: households
            .iter()
            .filter_map(|id| living_members.get(id))
            .sum(),
    })
}

fn check_fee_record(
    record: &FeeRecord,
    periods: &HashMap<FeePeriodId, &FeePeriod>,
    households: &HashSet<HouseholdId>,
) -> Result<(), AggregateError> {
    let malformed = |reason: String| AggregateError::MalformedFeeRecord {
        record_id: record.id,
        reason,
    };
    if record.amount_paid < 0 {
        return Err(malformed(format!("negative amount {}", record.amount_paid)));
    }
    if !periods.contains_key(&record.period_id) {
        return Err(malformed(format!("unknown fee period {}", record.period_id)));
    }
    if !households.contains(&record.household_id) {
        return Err(malformed(format!("unknown household {}", record.household_id)));
    }
    if record.status == PaymentStatus::Paid && record.collected_on.is_none() {
        return Err(malformed("paid without a collection date".into()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/aggregates_tests.rs"]
mod tests;
