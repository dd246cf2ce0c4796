use super::*;

#[test]
fn fields_split_on_first_equals() {
    assert_eq!(
        parse_field("address=12 Ngo Quyen, p=3").expect("field"),
        ("address".to_string(), "12 Ngo Quyen, p=3".to_string())
    );
    assert!(parse_field("address").is_err());
    assert!(parse_field("=value").is_err());
}

#[test]
fn transition_arguments_parse_into_typed_values() {
    let cli = Cli::try_parse_from([
        "registry-admin",
        "--database-url",
        "sqlite::memory:",
        "transition",
        "7",
        "TEMP_ABSENT",
        "--field",
        "startDate=2024-01-01",
        "--field",
        "address=123 Main",
    ])
    .expect("parse");

    let Command::Transition {
        citizen_id,
        target,
        fields,
        actor,
        ..
    } = cli.command
    else {
        panic!("unexpected command {:?}", cli.command);
    };
    assert_eq!(citizen_id, 7);
    assert_eq!(target, ResidencyStatus::TempAbsent);
    assert_eq!(actor, "registry-admin");
    assert_eq!(fields.len(), 2);
}

#[test]
fn fee_record_filters_are_optional_flags() {
    let cli = Cli::try_parse_from(["registry-admin", "fee-records", "--period-id", "3"])
        .expect("parse");
    let Command::FeeRecords {
        household_id,
        period_id,
    } = cli.command
    else {
        panic!("unexpected command {:?}", cli.command);
    };
    assert_eq!((household_id, period_id), (None, Some(3)));
}

#[test]
fn unknown_stats_key_is_a_usage_error() {
    assert!(Cli::try_parse_from(["registry-admin", "stats", "population"]).is_err());
}

#[tokio::test]
async fn commands_run_against_an_in_memory_registry() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ctx = registry_api::bootstrap(storage, Arc::new(SystemClock), AggregateConfig::default())
        .await
        .expect("bootstrap");

    run(
        &ctx,
        Command::CreateHousehold {
            code: "HK1".into(),
            head_name: "Le Van A".into(),
            address: "9 Tran Phu".into(),
            note: None,
        },
    )
    .await
    .expect("household");
    let household = ctx.storage.list_households().await.expect("list")[0].id;

    run(
        &ctx,
        Command::RegisterCitizen {
            household_id: household.0,
            full_name: "Le Van A".into(),
            national_id: "001070000001".into(),
            birth_date: NaiveDate::from_ymd_opt(1970, 5, 5).expect("date"),
            gender: Gender::Male,
        },
    )
    .await
    .expect("citizen");

    run(
        &ctx,
        Command::CreateFeePeriod {
            name: "2024 sanitation".into(),
            amount_per_member: 6_000,
            starts_on: NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
            ends_on: None,
        },
    )
    .await
    .expect("period");
    let period = ctx.storage.list_fee_periods().await.expect("periods")[0].id;
    run(&ctx, Command::Unpaid { period_id: period.0 })
        .await
        .expect("unpaid");
    run(
        &ctx,
        Command::FeeRecords {
            household_id: Some(household.0),
            period_id: None,
        },
    )
    .await
    .expect("fee records");

    let err = run(&ctx, Command::Unpaid { period_id: 404 })
        .await
        .expect_err("unknown period");
    assert_eq!(
        err.downcast_ref::<ApiException>().expect("api exception").code,
        shared::error::ErrorCode::NotFound
    );

    let err = run(
        &ctx,
        Command::History {
            citizen_id: 999,
        },
    )
    .await
    .expect_err("unknown citizen");
    let exception = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(exception.code, shared::error::ErrorCode::NotFound);
}
