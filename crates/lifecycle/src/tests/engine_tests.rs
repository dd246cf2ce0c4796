use super::*;
use crate::{
    aggregates::{AggregateConfig, FeeLedger},
    clock::FixedClock,
};
use chrono::NaiveDate;
use shared::domain::{Gender, StatusDetail};

struct Harness {
    engine: LifecycleEngine,
    clock: Arc<FixedClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(FixedClock::on(2024, 6, 15));
    let store = Arc::new(StatusRecordStore::new());
    let aggregates = Arc::new(AggregateCoordinator::new(
        Arc::clone(&store),
        clock.clone(),
        AggregateConfig::default(),
        FeeLedger::default(),
    ));
    let engine = LifecycleEngine::new(store, aggregates, clock.clone());
    engine
        .register(Citizen::new_resident(
            CitizenId(1),
            "Tran Thi B",
            NaiveDate::from_ymd_opt(1992, 8, 20).expect("date"),
            "079192000123",
            Gender::Female,
            HouseholdId(10),
        ))
        .expect("register");
    Harness { engine, clock }
}

fn request(target: ResidencyStatus, detail: DetailForm) -> TransitionRequest {
    TransitionRequest::new(CitizenId(1), target, detail, Actor::new("to-truong"))
}

fn absence() -> DetailForm {
    DetailForm::empty()
        .with("startDate", "2024-01-01")
        .with("address", "123 Main")
}

fn death() -> DetailForm {
    DetailForm::empty()
        .with("dateOfDeath", "2024-06-01")
        .with("cause", "stroke")
        .with("placeOfDeath", "Bach Mai hospital")
}

#[tokio::test]
async fn commit_stamps_event_from_clock_and_actor() {
    let h = harness();
    let result = h
        .engine
        .apply_transition(&request(ResidencyStatus::TempAbsent, absence()))
        .await
        .expect("commit");

    assert_eq!(result.citizen.status, ResidencyStatus::TempAbsent);
    assert_eq!(result.citizen.version, 1);
    assert!(matches!(result.citizen.detail, Some(StatusDetail::TempAbsent(_))));
    assert_eq!(result.event.sequence, 1);
    assert_eq!(result.event.previous_status, ResidencyStatus::Resident);
    assert_eq!(result.event.recorded_at, h.clock.now());
    assert_eq!(result.event.actor, Actor::new("to-truong"));
    assert!(result.invalidated.is_empty());
}

#[tokio::test]
async fn rejected_transition_leaves_store_untouched() {
    let h = harness();
    let before = h.engine.store().snapshot();

    let err = h
        .engine
        .apply_transition(&request(
            ResidencyStatus::TempAbsent,
            DetailForm::empty().with("startDate", "2024-01-01"),
        ))
        .await
        .expect_err("missing address");
    assert_eq!(
        err,
        LifecycleError::Validation(ValidationError::MissingField("address".into()))
    );

    let after = h.engine.store().snapshot();
    assert_eq!(after.version(), before.version());
    assert!(after.history(CitizenId(1)).is_empty());
}

#[tokio::test]
async fn stale_expected_version_is_refused() {
    let h = harness();
    h.engine
        .apply_transition(&request(ResidencyStatus::TempAbsent, absence()))
        .await
        .expect("first");

    let err = h
        .engine
        .apply_transition(&request(ResidencyStatus::Resident, DetailForm::empty()).expecting_version(0))
        .await
        .expect_err("stale");
    assert_eq!(
        err,
        LifecycleError::ConcurrentModification {
            citizen_id: CitizenId(1),
            expected: 0,
            found: 1,
        }
    );
}

#[tokio::test]
async fn deceased_citizens_refuse_everything() {
    let h = harness();
    let result = h
        .engine
        .apply_transition(&request(ResidencyStatus::Deceased, death()))
        .await
        .expect("death");
    assert_eq!(result.invalidated, CacheKey::ALL.into_iter().collect());

    for target in ResidencyStatus::ALL {
        let err = h
            .engine
            .apply_transition(&request(target, DetailForm::empty()))
            .await
            .expect_err("terminal");
        assert_eq!(err, LifecycleError::TerminalState(CitizenId(1)));
    }
    assert!(matches!(
        h.engine.preview(CitizenId(1), ResidencyStatus::Resident, &DetailForm::empty()),
        Err(LifecycleError::TerminalState(_))
    ));
    assert!(matches!(
        h.engine
            .move_household(CitizenId(1), HouseholdId(11), &Actor::new("clerk"))
            .await,
        Err(LifecycleError::TerminalState(_))
    ));
}

#[tokio::test]
async fn blank_actor_is_a_missing_field() {
    let h = harness();
    let mut req = request(ResidencyStatus::TempAbsent, absence());
    req.actor = Actor::new("  ");
    assert_eq!(
        h.engine.apply_transition(&req).await.expect_err("no actor"),
        LifecycleError::Validation(ValidationError::MissingField("actor".into()))
    );
}

#[tokio::test]
async fn preview_flags_destructive_transitions() {
    let h = harness();
    let preview = h
        .engine
        .preview(CitizenId(1), ResidencyStatus::Deceased, &death())
        .expect("preview");
    assert!(preview.requires_confirmation);
    assert_eq!(preview.from, ResidencyStatus::Resident);
    assert!(preview.invalidates.contains(&CacheKey::FeeStats));
    assert!(h.engine.store().history(CitizenId(1)).expect("history").is_empty());

    let preview = h
        .engine
        .preview(CitizenId(1), ResidencyStatus::TempAbsent, &absence())
        .expect("preview");
    assert!(!preview.requires_confirmation);
}

#[tokio::test]
async fn household_move_bumps_version_without_event() {
    let h = harness();
    let (moved, keys) = h
        .engine
        .move_household(CitizenId(1), HouseholdId(11), &Actor::new("clerk"))
        .await
        .expect("move");
    assert_eq!(moved.household_id, HouseholdId(11));
    assert_eq!(moved.version, 1);
    assert_eq!(keys, BTreeSet::from([CacheKey::FeeStats]));
    assert!(h.engine.store().history(CitizenId(1)).expect("history").is_empty());

    let (same, keys) = h
        .engine
        .move_household(CitizenId(1), HouseholdId(11), &Actor::new("clerk"))
        .await
        .expect("no-op move");
    assert_eq!(same.version, 1);
    assert!(keys.is_empty());
}

fn identity(actor: &str) -> CitizenUpdate {
    CitizenUpdate {
        full_name: None,
        birth_date: None,
        national_id: None,
        gender: None,
        actor: Actor::new(actor),
        expected_version: None,
    }
}

#[tokio::test]
async fn identity_update_invalidates_only_what_it_touches() {
    let h = harness();
    let (renamed, keys) = h
        .engine
        .update_identity(
            CitizenId(1),
            &CitizenUpdate {
                full_name: Some("  Tran Thi Bich ".into()),
                ..identity("clerk")
            },
        )
        .await
        .expect("rename");
    assert_eq!(renamed.full_name, "Tran Thi Bich");
    assert_eq!(renamed.version, 1);
    assert!(keys.is_empty());

    let (corrected, keys) = h
        .engine
        .update_identity(
            CitizenId(1),
            &CitizenUpdate {
                birth_date: NaiveDate::from_ymd_opt(1962, 8, 20),
                gender: Some(Gender::Male),
                expected_version: Some(1),
                ..identity("clerk")
            },
        )
        .await
        .expect("correct");
    assert_eq!(corrected.version, 2);
    assert_eq!(keys, BTreeSet::from([CacheKey::GenderStats, CacheKey::AgeStats]));
    assert!(h.engine.store().history(CitizenId(1)).expect("history").is_empty());
}

#[tokio::test]
async fn identity_update_guards_its_fields() {
    let h = harness();
    h.engine
        .register(Citizen::new_resident(
            CitizenId(2),
            "Pham Van D",
            NaiveDate::from_ymd_opt(1970, 1, 1).expect("date"),
            "001070000002",
            Gender::Male,
            HouseholdId(10),
        ))
        .expect("register");

    let err = h
        .engine
        .update_identity(
            CitizenId(1),
            &CitizenUpdate {
                national_id: Some("001070000002".into()),
                ..identity("clerk")
            },
        )
        .await
        .expect_err("taken");
    assert_eq!(err, LifecycleError::NationalIdTaken("001070000002".into()));

    let err = h
        .engine
        .update_identity(
            CitizenId(1),
            &CitizenUpdate {
                birth_date: NaiveDate::from_ymd_opt(2030, 1, 1),
                ..identity("clerk")
            },
        )
        .await
        .expect_err("future");
    assert!(matches!(
        err,
        LifecycleError::Validation(ValidationError::MalformedField { .. })
    ));

    let err = h
        .engine
        .update_identity(
            CitizenId(1),
            &CitizenUpdate {
                full_name: Some(" ".into()),
                ..identity("clerk")
            },
        )
        .await
        .expect_err("blank");
    assert_eq!(
        err,
        LifecycleError::Validation(ValidationError::MissingField("full_name".into()))
    );
    assert_eq!(h.engine.store().get(CitizenId(1)).expect("get").version, 0);

    let err = h
        .engine
        .update_identity(CitizenId(404), &identity("clerk"))
        .await
        .expect_err("unknown");
    assert_eq!(err, LifecycleError::NotFound(CitizenId(404)));
}
