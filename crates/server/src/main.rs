use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use futures::Stream;
use lifecycle::SystemClock;
use registry_api::RegistryContext;
use shared::{
    domain::{
        Citizen, CitizenId, FeePeriod, FeePeriodId, FeeRecord, FeeRecordId, Household,
        StatusEvent,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AggregateSnapshot, CacheKey, CitizenQuery, CitizenUpdate, CitizenUpdateReceipt,
        FeeRecordQuery, HouseholdMoveRequest, HouseholdSummary, NewCitizen, NewFeePeriod,
        NewFeeRecord, NewHousehold, Page, PreviewRequestBody, RegistryEvent, TransitionPreview,
        TransitionReceipt, TransitionRequestBody, UnpaidHousehold,
    },
};
use storage::Storage;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    registry: RegistryContext,
}

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            error = %format!("{error:#}"),
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let registry = registry_api::bootstrap(
        storage,
        Arc::new(SystemClock),
        settings.aggregate_config(),
    )
    .await?;
    spawn_pending_flush(
        registry.clone(),
        Duration::from_secs(u64::from(settings.flush_interval_secs)),
    );

    let app = build_router(Arc::new(AppState { registry }));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "registry server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Retries mirror writes that failed, until the process exits.
fn spawn_pending_flush(registry: RegistryContext, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if registry.pending_writes() == 0 {
                continue;
            }
            let remaining = registry_api::flush_pending_writes(&registry).await;
            if remaining > 0 {
                warn!(remaining, "mirror writes still pending");
            } else {
                info!("pending mirror writes flushed");
            }
        }
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/citizens", get(http_list_citizens).post(http_register_citizen))
        .route(
            "/citizens/:citizen_id",
            get(http_get_citizen).put(http_update_citizen),
        )
        .route("/citizens/:citizen_id/history", get(http_get_history))
        .route("/citizens/:citizen_id/transitions", post(http_request_transition))
        .route(
            "/citizens/:citizen_id/transitions/preview",
            post(http_preview_transition),
        )
        .route("/citizens/:citizen_id/household", post(http_move_household))
        .route("/households", get(http_list_households).post(http_create_household))
        .route("/fee-periods", get(http_list_fee_periods).post(http_create_fee_period))
        .route("/fee-periods/:period_id/unpaid", get(http_unpaid_households))
        .route("/fee-records", get(http_list_fee_records).post(http_record_fee))
        .route(
            "/fee-records/:record_id",
            put(http_update_fee_record).delete(http_delete_fee_record),
        )
        .route("/stats/:key", get(http_get_stats))
        .route("/events", get(http_events))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::InvalidTransition | ErrorCode::TerminalState | ErrorCode::Conflict => {
            StatusCode::CONFLICT
        }
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    registry_api::health(&state.registry)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, Json(e)))?;
    Ok("ok")
}

async fn http_list_citizens(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CitizenQuery>,
) -> HttpResult<Json<Page<Citizen>>> {
    registry_api::list_citizens(&state.registry, &query)
        .map(Json)
        .map_err(reject)
}

async fn http_register_citizen(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewCitizen>,
) -> HttpResult<(StatusCode, Json<Citizen>)> {
    let citizen = registry_api::register_citizen(&state.registry, req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(citizen)))
}

async fn http_get_citizen(
    State(state): State<Arc<AppState>>,
    Path(citizen_id): Path<i64>,
) -> HttpResult<Json<Citizen>> {
    registry_api::get_current_status(&state.registry, CitizenId(citizen_id))
        .map(Json)
        .map_err(reject)
}

async fn http_update_citizen(
    State(state): State<Arc<AppState>>,
    Path(citizen_id): Path<i64>,
    Json(req): Json<CitizenUpdate>,
) -> HttpResult<Json<CitizenUpdateReceipt>> {
    registry_api::update_citizen(&state.registry, CitizenId(citizen_id), req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_get_history(
    State(state): State<Arc<AppState>>,
    Path(citizen_id): Path<i64>,
) -> HttpResult<Json<Vec<StatusEvent>>> {
    registry_api::get_history(&state.registry, CitizenId(citizen_id))
        .map(Json)
        .map_err(reject)
}

async fn http_request_transition(
    State(state): State<Arc<AppState>>,
    Path(citizen_id): Path<i64>,
    Json(req): Json<TransitionRequestBody>,
) -> HttpResult<Json<TransitionReceipt>> {
    registry_api::request_transition(&state.registry, CitizenId(citizen_id), req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_preview_transition(
    State(state): State<Arc<AppState>>,
    Path(citizen_id): Path<i64>,
    Json(req): Json<PreviewRequestBody>,
) -> HttpResult<Json<TransitionPreview>> {
    registry_api::preview_transition(&state.registry, CitizenId(citizen_id), &req)
        .map(Json)
        .map_err(reject)
}

async fn http_move_household(
    State(state): State<Arc<AppState>>,
    Path(citizen_id): Path<i64>,
    Json(req): Json<HouseholdMoveRequest>,
) -> HttpResult<Json<CitizenUpdateReceipt>> {
    registry_api::move_household(&state.registry, CitizenId(citizen_id), req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_households(
    State(state): State<Arc<AppState>>,
) -> HttpResult<Json<Vec<HouseholdSummary>>> {
    registry_api::list_households(&state.registry)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_create_household(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewHousehold>,
) -> HttpResult<(StatusCode, Json<Household>)> {
    let household = registry_api::create_household(&state.registry, req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(household)))
}

async fn http_list_fee_periods(
    State(state): State<Arc<AppState>>,
) -> HttpResult<Json<Vec<FeePeriod>>> {
    registry_api::list_fee_periods(&state.registry)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_create_fee_period(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewFeePeriod>,
) -> HttpResult<(StatusCode, Json<FeePeriod>)> {
    let period = registry_api::create_fee_period(&state.registry, req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(period)))
}

async fn http_unpaid_households(
    State(state): State<Arc<AppState>>,
    Path(period_id): Path<i64>,
) -> HttpResult<Json<Vec<UnpaidHousehold>>> {
    registry_api::unpaid_households(&state.registry, FeePeriodId(period_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_fee_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeeRecordQuery>,
) -> HttpResult<Json<Vec<FeeRecord>>> {
    registry_api::list_fee_records(&state.registry, &query)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_update_fee_record(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<i64>,
    Json(req): Json<NewFeeRecord>,
) -> HttpResult<Json<FeeRecord>> {
    registry_api::update_fee_record(&state.registry, FeeRecordId(record_id), req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_delete_fee_record(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<i64>,
) -> HttpResult<StatusCode> {
    registry_api::delete_fee_record(&state.registry, FeeRecordId(record_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_record_fee(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewFeeRecord>,
) -> HttpResult<(StatusCode, Json<FeeRecord>)> {
    let record = registry_api::record_fee(&state.registry, req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn http_get_stats(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> HttpResult<Json<AggregateSnapshot>> {
    let key: CacheKey = key.parse().map_err(|_| {
        reject(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown statistics key '{key}'"),
        ))
    })?;
    registry_api::get_aggregate(&state.registry, key)
        .map(Json)
        .map_err(reject)
}

async fn http_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.registry.subscribe()).filter_map(|item| match item {
        Ok(event) => match Event::default().event(event_name(&event)).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(error) => {
                warn!(%error, "dropping unencodable registry event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "event subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn event_name(event: &RegistryEvent) -> &'static str {
    match event {
        RegistryEvent::StatusChanged { .. } => "status_changed",
        RegistryEvent::HouseholdChanged { .. } => "household_changed",
        RegistryEvent::CitizenUpdated { .. } => "citizen_updated",
        RegistryEvent::AggregatesInvalidated { .. } => "aggregates_invalidated",
        RegistryEvent::Error(_) => "error",
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
