use super::*;
use axum::{body, body::Body, http::Request, response::Response};
use lifecycle::{AggregateConfig, FixedClock};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_app() -> (Router, RegistryContext) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let registry = registry_api::bootstrap(
        storage,
        Arc::new(FixedClock::on(2024, 6, 15)),
        AggregateConfig::default(),
    )
    .await
    .expect("bootstrap");
    let app = build_router(Arc::new(AppState {
        registry: registry.clone(),
    }));
    (app, registry)
}

fn post_json(uri: &str, payload: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request")
}

fn put_json(uri: &str, payload: Value) -> Request<Body> {
    Request::put(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request")
}

fn fetch(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("request")
}

async fn read_json<T: DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

/// Creates one household and one resident; returns the citizen id.
async fn seed(app: &Router) -> i64 {
    let response = app
        .clone()
        .oneshot(post_json(
            "/households",
            json!({ "code": "HK001", "head_name": "Tran Van M", "address": "5 Le Loi" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let household: Household = read_json(response).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/citizens",
            json!({
                "full_name": "Tran Van M",
                "birth_date": "1980-02-02",
                "national_id": "001080000555",
                "gender": "Nam",
                "household_id": household.id.0,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let citizen: Citizen = read_json(response).await;
    citizen.id.0
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _registry) = test_app().await;
    let response = app.oneshot(fetch("/healthz")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn transition_route_commits_and_history_lists_it() {
    let (app, registry) = test_app().await;
    let citizen_id = seed(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/citizens/{citizen_id}/transitions"),
            json!({
                "target": "TEMP_ABSENT",
                "detail": { "startDate": "2024-01-01", "address": "123 Main" },
                "actor": "ward-clerk",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: TransitionReceipt = read_json(response).await;
    assert!(receipt.persisted);
    assert_eq!(receipt.commit.citizen.status.as_str(), "TEMP_ABSENT");

    let response = app
        .clone()
        .oneshot(fetch(&format!("/citizens/{citizen_id}/history")))
        .await
        .expect("response");
    let history: Vec<StatusEvent> = read_json(response).await;
    assert_eq!(history, vec![receipt.commit.event]);

    let stored = registry.storage.load_status_events().await.expect("events");
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn error_codes_map_to_http_statuses() {
    let (app, _registry) = test_app().await;
    let citizen_id = seed(&app).await;

    let response = app
        .clone()
        .oneshot(fetch("/citizens/4242"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::NotFound);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/citizens/{citizen_id}/transitions"),
            json!({ "target": "TEMP_ABSENT", "detail": { "startDate": "2024-01-01" }, "actor": "clerk" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/citizens/{citizen_id}/transitions"),
            json!({ "target": "RESIDENT", "actor": "clerk" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::InvalidTransition);

    let response = app
        .oneshot(fetch("/stats/population-pyramid"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn preview_flags_death_without_committing() {
    let (app, registry) = test_app().await;
    let citizen_id = seed(&app).await;

    let response = app
        .oneshot(post_json(
            &format!("/citizens/{citizen_id}/transitions/preview"),
            json!({
                "target": "DECEASED",
                "detail": { "dateOfDeath": "2024-06-01", "cause": "illness", "placeOfDeath": "home" },
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let preview: TransitionPreview = read_json(response).await;
    assert!(preview.requires_confirmation);
    assert!(preview.invalidates.contains(&CacheKey::FeeStats));
    assert!(registry_api::get_history(&registry, CitizenId(citizen_id))
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn stats_and_listing_routes_answer() {
    let (app, _registry) = test_app().await;
    seed(&app).await;

    let response = app
        .clone()
        .oneshot(fetch("/stats/gender-stats"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot: AggregateSnapshot = read_json(response).await;
    assert_eq!(snapshot.key, CacheKey::GenderStats);

    let response = app
        .clone()
        .oneshot(fetch("/citizens?status=RESIDENT&q=tran&page_size=5"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let page: Page<Citizen> = read_json(response).await;
    assert_eq!(page.total, 1);
    assert_eq!(page.page_size, 5);

    let response = app
        .oneshot(fetch("/households"))
        .await
        .expect("response");
    let households: Vec<HouseholdSummary> = read_json(response).await;
    assert_eq!(households[0].member_count, 1);
}

#[tokio::test]
async fn oversized_bodies_are_refused() {
    let (app, _registry) = test_app().await;
    let payload = json!({ "code": "HK9", "head_name": "x".repeat(MAX_BODY_BYTES), "address": "a" })
        .to_string();
    let request = Request::post("/households")
        .header("content-type", "application/json")
        .header("content-length", payload.len())
        .body(Body::from(payload))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn events_route_streams_server_sent_events() {
    let (app, _registry) = test_app().await;
    let response = app.oneshot(fetch("/events")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));
}

#[tokio::test]
async fn citizen_update_route_corrects_identity() {
    let (app, registry) = test_app().await;
    let citizen_id = seed(&app).await;

    let response = app
        .clone()
        .oneshot(put_json(
            &format!("/citizens/{citizen_id}"),
            json!({ "full_name": "Tran Van Minh", "birth_date": "1981-02-02", "actor": "clerk" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: CitizenUpdateReceipt = read_json(response).await;
    assert!(receipt.persisted);
    assert!(receipt.invalidated.contains(&CacheKey::AgeStats));
    assert_eq!(
        registry.storage.load_citizens().await.expect("citizens")[0].full_name,
        "Tran Van Minh"
    );
    assert_eq!(
        event_name(&RegistryEvent::CitizenUpdated {
            citizen: receipt.citizen.clone()
        }),
        "citizen_updated"
    );

    // Status has its own route.
    let response = app
        .oneshot(put_json(
            &format!("/citizens/{citizen_id}"),
            json!({ "status": "DECEASED", "actor": "clerk" }),
        ))
        .await
        .expect("response");
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn fee_record_routes_filter_edit_and_delete() {
    let (app, _registry) = test_app().await;
    seed(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/fee-periods",
            json!({ "name": "2024 sanitation", "amount_per_member": 6000, "starts_on": "2024-01-01" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let period: FeePeriod = read_json(response).await;

    let response = app
        .clone()
        .oneshot(fetch(&format!("/fee-periods/{}/unpaid", period.id.0)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let owing: Vec<UnpaidHousehold> = read_json(response).await;
    assert_eq!(owing.len(), 1);
    assert_eq!(owing[0].amount_due, 6_000);
    let household_id = owing[0].household.id.0;

    let unpaid = json!({
        "period_id": period.id.0,
        "household_id": household_id,
        "amount_paid": 0,
        "status": "UNPAID",
    });
    let response = app
        .clone()
        .oneshot(post_json("/fee-records", unpaid))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let record: FeeRecord = read_json(response).await;

    let response = app
        .clone()
        .oneshot(put_json(
            &format!("/fee-records/{}", record.id.0),
            json!({
                "period_id": period.id.0,
                "household_id": household_id,
                "amount_paid": 6000,
                "collected_on": "2024-05-05",
                "status": "PAID",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(fetch(&format!(
            "/fee-records?household_id={household_id}&period_id={}",
            period.id.0
        )))
        .await
        .expect("response");
    let records: Vec<FeeRecord> = read_json(response).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].amount_paid, 6_000);

    let response = app
        .clone()
        .oneshot(fetch(&format!("/fee-periods/{}/unpaid", period.id.0)))
        .await
        .expect("response");
    let owing: Vec<UnpaidHousehold> = read_json(response).await;
    assert!(owing.is_empty());

    let delete = || {
        Request::delete(format!("/fee-records/{}", record.id.0))
            .body(Body::empty())
            .expect("request")
    };
    let response = app.clone().oneshot(delete()).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app.clone().oneshot(delete()).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(fetch("/fee-periods/404/unpaid"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn flush_task_leaves_an_empty_queue_alone() {
    let (_app, registry) = test_app().await;
    let task = spawn_pending_flush(registry.clone(), Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!task.is_finished());
    assert_eq!(registry.pending_writes(), 0);
    task.abort();
}

#[test]
fn event_names_follow_variants() {
    let event = RegistryEvent::AggregatesInvalidated {
        keys: [CacheKey::FeeStats].into_iter().collect(),
    };
    assert_eq!(event_name(&event), "aggregates_invalidated");

    assert_eq!(status_for(ErrorCode::TerminalState), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorCode::Validation), StatusCode::UNPROCESSABLE_ENTITY);
}
