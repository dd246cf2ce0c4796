use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lifecycle::{FeeLedger, RegistryBackend, RegistryImage};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{
        Actor, Citizen, CitizenId, FeePeriod, FeePeriodId, FeeRecord, FeeRecordId, Gender,
        Household, HouseholdId, PaymentStatus, ResidencyStatus, StatusDetail, StatusEvent,
    },
    protocol::{FeeRecordQuery, NewCitizen, NewFeePeriod, NewFeeRecord, NewHousehold},
};

const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to an in-memory database opens a fresh one.
        let max_connections = if database_url == MEMORY_URL { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run registry migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_household(&self, new: &NewHousehold) -> Result<Household> {
        let rec = sqlx::query(
            "INSERT INTO households (code, head_name, address, note) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(&new.code)
        .bind(&new.head_name)
        .bind(&new.address)
        .bind(new.note.as_deref())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert household '{}'", new.code))?;
        Ok(Household {
            id: HouseholdId(rec.try_get("id")?),
            code: new.code.clone(),
            head_name: new.head_name.clone(),
            address: new.address.clone(),
            note: new.note.clone(),
        })
    }

    pub async fn household(&self, household_id: HouseholdId) -> Result<Option<Household>> {
        let row = sqlx::query("SELECT id, code, head_name, address, note FROM households WHERE id = ?")
            .bind(household_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(household_from_row).transpose()
    }

    pub async fn list_households(&self) -> Result<Vec<Household>> {
        let rows = sqlx::query("SELECT id, code, head_name, address, note FROM households ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(household_from_row).collect()
    }

    /// Inserts a citizen as RESIDENT at version 0.
    pub async fn create_citizen(&self, new: &NewCitizen) -> Result<Citizen> {
        let rec = sqlx::query(
            "INSERT INTO citizens (household_id, full_name, birth_date, national_id, gender, status, version)
             VALUES (?, ?, ?, ?, ?, ?, 0)
             RETURNING id",
        )
        .bind(new.household_id.0)
        .bind(&new.full_name)
        .bind(new.birth_date)
        .bind(&new.national_id)
        .bind(new.gender.as_str())
        .bind(ResidencyStatus::Resident.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert citizen '{}'", new.national_id))?;
        Ok(Citizen::new_resident(
            CitizenId(rec.try_get("id")?),
            new.full_name.clone(),
            new.birth_date,
            new.national_id.clone(),
            new.gender,
            new.household_id,
        ))
    }

    pub async fn load_citizens(&self) -> Result<Vec<Citizen>> {
        let rows = sqlx::query(
            "SELECT id, household_id, full_name, birth_date, national_id, gender, status, detail_json, version
             FROM citizens
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(citizen_from_row).collect()
    }

    pub async fn load_status_events(&self) -> Result<Vec<StatusEvent>> {
        let rows = sqlx::query(
            "SELECT event_id, citizen_id, sequence, previous_status, new_status, detail_json, recorded_at, actor
             FROM status_events
             ORDER BY citizen_id, sequence",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn create_fee_period(&self, new: &NewFeePeriod) -> Result<FeePeriod> {
        let rec = sqlx::query(
            "INSERT INTO fee_periods (name, amount_per_member, starts_on, ends_on) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(&new.name)
        .bind(new.amount_per_member)
        .bind(new.starts_on)
        .bind(new.ends_on)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert fee period '{}'", new.name))?;
        Ok(FeePeriod {
            id: FeePeriodId(rec.try_get("id")?),
            name: new.name.clone(),
            amount_per_member: new.amount_per_member,
            starts_on: new.starts_on,
            ends_on: new.ends_on,
        })
    }

    pub async fn fee_period(&self, period_id: FeePeriodId) -> Result<Option<FeePeriod>> {
        let row = sqlx::query(
            "SELECT id, name, amount_per_member, starts_on, ends_on FROM fee_periods WHERE id = ?",
        )
        .bind(period_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(fee_period_from_row).transpose()
    }

    pub async fn list_fee_periods(&self) -> Result<Vec<FeePeriod>> {
        let rows = sqlx::query(
            "SELECT id, name, amount_per_member, starts_on, ends_on FROM fee_periods ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fee_period_from_row).collect()
    }

    pub async fn insert_fee_record(&self, new: &NewFeeRecord) -> Result<FeeRecord> {
        let rec = sqlx::query(
            "INSERT INTO fee_records (period_id, household_id, amount_paid, collected_on, status)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(new.period_id.0)
        .bind(new.household_id.0)
        .bind(new.amount_paid)
        .bind(new.collected_on)
        .bind(new.status.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to insert fee record for household {} in period {}",
                new.household_id, new.period_id
            )
        })?;
        Ok(FeeRecord {
            id: FeeRecordId(rec.try_get("id")?),
            period_id: new.period_id,
            household_id: new.household_id,
            amount_paid: new.amount_paid,
            collected_on: new.collected_on,
            status: new.status,
        })
    }

    pub async fn fee_record(&self, record_id: FeeRecordId) -> Result<Option<FeeRecord>> {
        let row = sqlx::query(
            "SELECT id, period_id, household_id, amount_paid, collected_on, status FROM fee_records WHERE id = ?",
        )
        .bind(record_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(fee_record_from_row).transpose()
    }

    /// Records in id order; unset filters match everything.
    pub async fn list_fee_records(&self, query: &FeeRecordQuery) -> Result<Vec<FeeRecord>> {
        let rows = sqlx::query(
            "SELECT id, period_id, household_id, amount_paid, collected_on, status
             FROM fee_records
             WHERE (?1 IS NULL OR household_id = ?1) AND (?2 IS NULL OR period_id = ?2)
             ORDER BY id",
        )
        .bind(query.household_id)
        .bind(query.period_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fee_record_from_row).collect()
    }

    /// Replaces every field of an existing record. `None` when it does not exist.
    pub async fn update_fee_record(
        &self,
        record_id: FeeRecordId,
        changes: &NewFeeRecord,
    ) -> Result<Option<FeeRecord>> {
        let updated = sqlx::query(
            "UPDATE fee_records
             SET period_id = ?, household_id = ?, amount_paid = ?, collected_on = ?, status = ?
             WHERE id = ?",
        )
        .bind(changes.period_id.0)
        .bind(changes.household_id.0)
        .bind(changes.amount_paid)
        .bind(changes.collected_on)
        .bind(changes.status.as_str())
        .bind(record_id.0)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update fee record {record_id}"))?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(FeeRecord {
            id: record_id,
            period_id: changes.period_id,
            household_id: changes.household_id,
            amount_paid: changes.amount_paid,
            collected_on: changes.collected_on,
            status: changes.status,
        }))
    }

    /// Returns whether a record was removed.
    pub async fn delete_fee_record(&self, record_id: FeeRecordId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM fee_records WHERE id = ?")
            .bind(record_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete fee record {record_id}"))?;
        Ok(deleted.rows_affected() == 1)
    }

    /// Writes the committed citizen row and its event in one transaction.
    /// The row must still be at the version preceding `citizen.version`,
    /// unless this exact event is already stored.
    pub async fn record_transition(&self, citizen: &Citizen, event: &StatusEvent) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let recorded: Option<i64> = sqlx::query_scalar("SELECT 1 FROM status_events WHERE event_id = ?")
            .bind(event.event_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if recorded.is_some() {
            return Ok(());
        }

        let (version, previous) = versions(citizen)?;
        let updated = sqlx::query(
            "UPDATE citizens SET status = ?, detail_json = ?, version = ? WHERE id = ? AND version = ?",
        )
        .bind(citizen.status.as_str())
        .bind(detail_json(citizen.detail.as_ref())?)
        .bind(version)
        .bind(citizen.id.0)
        .bind(previous)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            bail!(
                "citizen {} is not at version {previous}; refusing to record sequence {}",
                citizen.id,
                event.sequence
            );
        }

        sqlx::query(
            "INSERT INTO status_events (event_id, citizen_id, sequence, previous_status, new_status, detail_json, recorded_at, actor)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.event_id.to_string())
        .bind(event.citizen_id.0)
        .bind(i64::try_from(event.sequence).context("sequence out of range")?)
        .bind(event.previous_status.as_str())
        .bind(event.new_status.as_str())
        .bind(detail_json(event.detail.as_ref())?)
        .bind(event.recorded_at)
        .bind(event.actor.as_str())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to append event {} for citizen {}", event.sequence, event.citizen_id))?;

        tx.commit().await?;
        Ok(())
    }

    /// Writes household and identity fields. Status columns are owned by
    /// `record_transition`. Replaying an applied version is accepted.
    pub async fn update_citizen(&self, citizen: &Citizen) -> Result<()> {
        let (version, previous) = versions(citizen)?;
        let updated = sqlx::query(
            "UPDATE citizens
             SET household_id = ?, full_name = ?, birth_date = ?, national_id = ?, gender = ?, version = ?
             WHERE id = ? AND version = ?",
        )
        .bind(citizen.household_id.0)
        .bind(&citizen.full_name)
        .bind(citizen.birth_date)
        .bind(&citizen.national_id)
        .bind(citizen.gender.as_str())
        .bind(version)
        .bind(citizen.id.0)
        .bind(previous)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update citizen {}", citizen.id))?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let stored: Option<i64> = sqlx::query_scalar("SELECT version FROM citizens WHERE id = ?")
            .bind(citizen.id.0)
            .fetch_optional(&self.pool)
            .await?;
        if stored != Some(version) {
            bail!("citizen {} is not at version {previous}", citizen.id);
        }
        Ok(())
    }

    pub async fn fee_ledger(&self) -> Result<FeeLedger> {
        Ok(FeeLedger {
            households: self.list_households().await?,
            periods: self.list_fee_periods().await?,
            records: self.list_fee_records(&FeeRecordQuery::default()).await?,
        })
    }
}

/// True when a UNIQUE constraint refused the write somewhere in `err`'s chain.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<sqlx::Error>())
        .any(|cause| match cause {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        })
}

fn versions(citizen: &Citizen) -> Result<(i64, i64)> {
    let version = i64::try_from(citizen.version).context("version out of range")?;
    if version == 0 {
        bail!("citizen {} has no prior version to replace", citizen.id);
    }
    Ok((version, version - 1))
}

fn detail_json(detail: Option<&StatusDetail>) -> Result<Option<String>> {
    detail
        .map(serde_json::to_string)
        .transpose()
        .context("failed to encode status detail")
}

fn parse_detail(raw: Option<String>) -> Result<Option<StatusDetail>> {
    raw.map(|json| serde_json::from_str(&json))
        .transpose()
        .context("failed to decode status detail")
}

fn fee_period_from_row(r: &SqliteRow) -> Result<FeePeriod> {
    Ok(FeePeriod {
        id: FeePeriodId(r.try_get("id")?),
        name: r.try_get("name")?,
        amount_per_member: r.try_get("amount_per_member")?,
        starts_on: r.try_get::<NaiveDate, _>("starts_on")?,
        ends_on: r.try_get::<Option<NaiveDate>, _>("ends_on")?,
    })
}

fn fee_record_from_row(r: &SqliteRow) -> Result<FeeRecord> {
    Ok(FeeRecord {
        id: FeeRecordId(r.try_get("id")?),
        period_id: FeePeriodId(r.try_get("period_id")?),
        household_id: HouseholdId(r.try_get("household_id")?),
        amount_paid: r.try_get("amount_paid")?,
        collected_on: r.try_get::<Option<NaiveDate>, _>("collected_on")?,
        status: PaymentStatus::from_str(&r.try_get::<String, _>("status")?)?,
    })
}

fn household_from_row(r: &SqliteRow) -> Result<Household> {
    Ok(Household {
        id: HouseholdId(r.try_get("id")?),
        code: r.try_get("code")?,
        head_name: r.try_get("head_name")?,
        address: r.try_get("address")?,
        note: r.try_get("note")?,
    })
}

fn citizen_from_row(r: &SqliteRow) -> Result<Citizen> {
    let id = CitizenId(r.try_get("id")?);
    let version: i64 = r.try_get("version")?;
    Ok(Citizen {
        id,
        full_name: r.try_get("full_name")?,
        birth_date: r.try_get::<NaiveDate, _>("birth_date")?,
        national_id: r.try_get("national_id")?,
        gender: Gender::from_str(&r.try_get::<String, _>("gender")?)?,
        household_id: HouseholdId(r.try_get("household_id")?),
        status: ResidencyStatus::from_str(&r.try_get::<String, _>("status")?)
            .with_context(|| format!("citizen {id} has an unreadable status"))?,
        detail: parse_detail(r.try_get("detail_json")?)?,
        version: u64::try_from(version).map_err(|_| anyhow!("citizen {id} has version {version}"))?,
    })
}

fn event_from_row(r: &SqliteRow) -> Result<StatusEvent> {
    let sequence: i64 = r.try_get("sequence")?;
    Ok(StatusEvent {
        event_id: Uuid::parse_str(&r.try_get::<String, _>("event_id")?)?,
        citizen_id: CitizenId(r.try_get("citizen_id")?),
        sequence: u64::try_from(sequence).map_err(|_| anyhow!("negative sequence {sequence}"))?,
        previous_status: ResidencyStatus::from_str(&r.try_get::<String, _>("previous_status")?)?,
        new_status: ResidencyStatus::from_str(&r.try_get::<String, _>("new_status")?)?,
        detail: parse_detail(r.try_get("detail_json")?)?,
        recorded_at: r.try_get::<DateTime<Utc>, _>("recorded_at")?,
        actor: Actor::new(r.try_get::<String, _>("actor")?),
    })
}

/// Creates the directory holding a file-backed SQLite database.
pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

/// File path of a `sqlite:` URL; `None` for in-memory or other schemes.
pub fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl RegistryBackend for Storage {
    async fn load_registry(&self) -> Result<RegistryImage> {
        Ok(RegistryImage {
            citizens: self.load_citizens().await?,
            events: self.load_status_events().await?,
        })
    }

    async fn load_fee_ledger(&self) -> Result<FeeLedger> {
        self.fee_ledger().await
    }

    async fn record_transition(&self, citizen: &Citizen, event: &StatusEvent) -> Result<()> {
        Storage::record_transition(self, citizen, event).await
    }

    async fn record_citizen_update(&self, citizen: &Citizen) -> Result<()> {
        self.update_citizen(citizen).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
