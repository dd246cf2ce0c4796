use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use lifecycle::{AggregateConfig, SystemClock};
use registry_api::RegistryContext;
use serde::Serialize;
use shared::{
    domain::{Actor, CitizenId, FeePeriodId, Gender, HouseholdId, PaymentStatus, ResidencyStatus},
    error::{ApiError, ApiException},
    protocol::{
        CacheKey, CitizenQuery, DetailForm, FeeRecordQuery, NewCitizen, NewFeePeriod,
        NewFeeRecord, NewHousehold, TransitionRequestBody,
    },
};
use storage::Storage;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "registry-admin", about = "Maintenance commands for the residency registry")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/registry.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateHousehold {
        code: String,
        head_name: String,
        address: String,
        #[arg(long)]
        note: Option<String>,
    },
    RegisterCitizen {
        household_id: i64,
        full_name: String,
        national_id: String,
        /// YYYY-MM-DD
        birth_date: NaiveDate,
        /// "Nam" or "Nữ"
        gender: Gender,
    },
    /// Applies a status transition; detail fields are given as key=value.
    Transition {
        citizen_id: i64,
        target: ResidencyStatus,
        #[arg(long, default_value = "registry-admin")]
        actor: String,
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        #[arg(long)]
        expected_version: Option<u64>,
    },
    CreateFeePeriod {
        name: String,
        amount_per_member: i64,
        starts_on: NaiveDate,
        #[arg(long)]
        ends_on: Option<NaiveDate>,
    },
    RecordFee {
        period_id: i64,
        household_id: i64,
        amount_paid: i64,
        #[arg(long)]
        collected_on: Option<NaiveDate>,
        /// PAID or UNPAID
        #[arg(long, default_value = "PAID")]
        status: PaymentStatus,
    },
    FeeRecords {
        #[arg(long)]
        household_id: Option<i64>,
        #[arg(long)]
        period_id: Option<i64>,
    },
    /// Households with living members and no PAID record for the period.
    Unpaid {
        period_id: i64,
    },
    ListCitizens {
        #[arg(long)]
        q: Option<String>,
        #[arg(long)]
        status: Option<ResidencyStatus>,
        #[arg(long)]
        page: Option<u32>,
    },
    History {
        citizen_id: i64,
    },
    /// gender-stats, age-stats or fee-stats
    Stats {
        key: CacheKey,
    },
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn checked<T>(result: Result<T, ApiError>) -> Result<T, ApiException> {
    result.map_err(ApiException::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let ctx = registry_api::bootstrap(storage, Arc::new(SystemClock), AggregateConfig::default())
        .await?;

    run(&ctx, cli.command).await
}

async fn run(ctx: &RegistryContext, command: Command) -> Result<()> {
    match command {
        Command::CreateHousehold {
            code,
            head_name,
            address,
            note,
        } => {
            let household = checked(
                registry_api::create_household(
                    ctx,
                    NewHousehold {
                        code,
                        head_name,
                        address,
                        note,
                    },
                )
                .await,
            )?;
            println!("created household_id={}", household.id);
        }
        Command::RegisterCitizen {
            household_id,
            full_name,
            national_id,
            birth_date,
            gender,
        } => {
            let citizen = checked(
                registry_api::register_citizen(
                    ctx,
                    NewCitizen {
                        full_name,
                        birth_date,
                        national_id,
                        gender,
                        household_id: HouseholdId(household_id),
                    },
                )
                .await,
            )?;
            println!("created citizen_id={}", citizen.id);
        }
        Command::Transition {
            citizen_id,
            target,
            actor,
            fields,
            expected_version,
        } => {
            let detail = fields
                .into_iter()
                .fold(DetailForm::empty(), |form, (k, v)| form.with(&k, v));
            let receipt = checked(
                registry_api::request_transition(
                    ctx,
                    CitizenId(citizen_id),
                    TransitionRequestBody {
                        target,
                        detail,
                        actor: Actor::new(actor),
                        expected_version,
                    },
                )
                .await,
            )?;
            if !receipt.persisted {
                anyhow::bail!(
                    "transition for citizen {citizen_id} was accepted but could not be written"
                );
            }
            print(&receipt.commit.event)?;
        }
        Command::CreateFeePeriod {
            name,
            amount_per_member,
            starts_on,
            ends_on,
        } => {
            let period = checked(
                registry_api::create_fee_period(
                    ctx,
                    NewFeePeriod {
                        name,
                        amount_per_member,
                        starts_on,
                        ends_on,
                    },
                )
                .await,
            )?;
            println!("created fee_period_id={}", period.id);
        }
        Command::RecordFee {
            period_id,
            household_id,
            amount_paid,
            collected_on,
            status,
        } => {
            let record = checked(
                registry_api::record_fee(
                    ctx,
                    NewFeeRecord {
                        period_id: FeePeriodId(period_id),
                        household_id: HouseholdId(household_id),
                        amount_paid,
                        collected_on,
                        status,
                    },
                )
                .await,
            )?;
            println!("created fee_record_id={}", record.id);
        }
        Command::FeeRecords {
            household_id,
            period_id,
        } => {
            let query = FeeRecordQuery {
                household_id,
                period_id,
            };
            print(&checked(registry_api::list_fee_records(ctx, &query).await)?)?;
        }
        Command::Unpaid { period_id } => {
            print(&checked(
                registry_api::unpaid_households(ctx, FeePeriodId(period_id)).await,
            )?)?;
        }
        Command::ListCitizens { q, status, page } => {
            let query = CitizenQuery {
                q,
                status,
                page,
                ..CitizenQuery::default()
            };
            print(&checked(registry_api::list_citizens(ctx, &query))?)?;
        }
        Command::History { citizen_id } => {
            print(&checked(registry_api::get_history(ctx, CitizenId(citizen_id)))?)?;
        }
        Command::Stats { key } => {
            print(&checked(registry_api::get_aggregate(ctx, key))?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
