use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::tempdir;
use tempuser_core::accounts::{AuthManager, AutoCreateSource, LocalAccountStore, User};
use tempuser_core::clock::FixedClock;
use tempuser_core::config::{SerialMappingConfig, ToolConfig};
use tempuser_core::migrate::{open_connection, run_migrations};
use tempuser_core::serial_provider::load_shard_counters;
use tempuser_core::session::{Session, SqliteSessionStore};
use tempuser_core::status::{MessageParam, THROTTLE_HIT, UNABLE_TO_ACQUIRE};
use tempuser_core::throttle::ThrottleCondition;
use tempuser_core::{RequestContext, STASH_KEY, TempUserCreator, TempUserError};

const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

fn migrated_db() -> (tempfile::TempDir, PathBuf) {
    let temp = tempdir().expect("tempdir");
    let db_path = temp.path().join("data/tempuser.db");
    run_migrations(&db_path).expect("migrate");
    (temp, db_path)
}

fn enabled_config(gen_pattern: &str) -> ToolConfig {
    let mut config = ToolConfig::default();
    config.temp_user.enabled = true;
    config.temp_user.gen_pattern = gen_pattern.to_string();
    config.temp_user.serial_mapping = SerialMappingConfig {
        kind: "plain-numeric".to_string(),
        ..SerialMappingConfig::default()
    };
    config
}

fn counter_total(db_path: &Path) -> u64 {
    let connection = open_connection(db_path).expect("open");
    load_shard_counters(&connection)
        .expect("counters")
        .iter()
        .map(|counter| counter.value)
        .sum()
}

#[test]
fn first_acquisition_with_literal_two_prefix_yields_tilde_21() {
    let (_temp, db_path) = migrated_db();
    let creator = TempUserCreator::local(
        &db_path,
        &enabled_config("~2$1"),
        Arc::new(FixedClock::default()),
    )
    .expect("creator");

    let status = creator.create(None, None).expect("create");
    assert!(status.is_good(), "{status:?}");
    let user = status.user.expect("user");
    assert_eq!(user.name, "~21");
    assert!(user.id.is_some());
    assert!(creator.is_temp_name("~21"));
    assert!(!creator.is_temp_name("User123"));

    let store = LocalAccountStore::new(&db_path, Arc::new(FixedClock::default()));
    let account = store.find_account("~21").expect("find").expect("account");
    assert!(account.is_temp);
}

#[test]
fn collision_with_existing_account_is_unable_to_acquire() {
    let (_temp, db_path) = migrated_db();
    let clock = Arc::new(FixedClock::default());
    let store = LocalAccountStore::new(&db_path, clock.clone());
    store
        .auto_create_user(
            &User::new_from_name("~1").expect("valid"),
            AutoCreateSource::Session,
            false,
            false,
        )
        .expect("seed account");

    let creator = TempUserCreator::local(&db_path, &enabled_config("~$1"), clock).expect("creator");
    let status = creator.create(None, None).expect("create");
    assert!(!status.is_ok());
    assert_eq!(status.first_error_key(), Some(UNABLE_TO_ACQUIRE));
    assert!(status.user.is_none());

    // No retry happened, but the next call draws a fresh index.
    assert_eq!(counter_total(&db_path), 1);
    let status = creator.create(None, None).expect("create again");
    assert_eq!(status.user.map(|user| user.name), Some("~2".to_string()));
}

#[test]
fn stashed_name_is_reused_across_requests() {
    let (_temp, db_path) = migrated_db();
    let creator = TempUserCreator::local(
        &db_path,
        &enabled_config("~$1"),
        Arc::new(FixedClock::default()),
    )
    .expect("creator");
    let store = SqliteSessionStore::new(&db_path);

    let mut first_request = store.load("session-1", Some(IP)).expect("load");
    let first = creator
        .acquire_and_stash_name(&mut first_request)
        .expect("stash");
    let mut second_request = store.load("session-1", Some(IP)).expect("reload");
    assert_eq!(second_request.get(STASH_KEY), first);
    let second = creator
        .acquire_and_stash_name(&mut second_request)
        .expect("stash again");

    assert_eq!(first, Some("~1".to_string()));
    assert_eq!(first, second);
    assert_eq!(counter_total(&db_path), 1);
    assert_eq!(creator.stashed_name(&second_request), first);

    let status = creator
        .create(first.as_deref(), Some(&RequestContext::from_ip(IP)))
        .expect("create stashed");
    assert!(status.is_good());
    assert_eq!(counter_total(&db_path), 1);
}

#[test]
fn account_creation_throttle_reports_count_and_wait() {
    let (_temp, db_path) = migrated_db();
    let clock = Arc::new(FixedClock::default());
    let mut config = enabled_config("~$1");
    config.throttle.account_creation = vec![ThrottleCondition::new(1, 60)];
    let creator = TempUserCreator::local(&db_path, &config, clock.clone()).expect("creator");
    let request = RequestContext::from_ip(IP);

    assert!(creator.create(None, Some(&request)).expect("create").is_ok());
    clock.advance(15);
    let status = creator.create(None, Some(&request)).expect("create");
    assert_eq!(status.first_error_key(), Some(THROTTLE_HIT));
    assert_eq!(
        status.errors[0].params,
        vec![MessageParam::Num(1), MessageParam::Duration(45)]
    );
    assert_eq!(counter_total(&db_path), 1);

    // Calls without a request context are not throttled.
    assert!(creator.create(None, None).expect("create").is_ok());
}

#[test]
fn account_creation_throttle_holds_across_creators() {
    let (_temp, db_path) = migrated_db();
    let clock = Arc::new(FixedClock::default());
    let mut config = enabled_config("~$1");
    config.throttle.account_creation = vec![ThrottleCondition::new(1, 86_400)];
    let request = RequestContext::from_ip(IP);

    let first = TempUserCreator::local(&db_path, &config, clock.clone()).expect("first creator");
    let status = first.create(None, Some(&request)).expect("create");
    assert!(status.is_good());
    drop(first);

    let second = TempUserCreator::local(&db_path, &config, clock).expect("second creator");
    let status = second.create(None, Some(&request)).expect("create");
    assert_eq!(status.first_error_key(), Some(THROTTLE_HIT));
    assert!(status.user.is_none());
    assert_eq!(counter_total(&db_path), 1);
}

#[test]
fn throttled_name_acquisition_stashes_nothing() {
    let (_temp, db_path) = migrated_db();
    let mut config = enabled_config("~$1");
    config.throttle.name_acquisition = vec![ThrottleCondition::new(1, 3600)];
    let creator = TempUserCreator::local(&db_path, &config, Arc::new(FixedClock::default()))
        .expect("creator");
    let store = SqliteSessionStore::new(&db_path);

    let mut first = store.load("a", Some(IP)).expect("load");
    assert!(creator.acquire_and_stash_name(&mut first).expect("stash").is_some());

    let mut second = store.load("b", Some(IP)).expect("load");
    assert_eq!(creator.acquire_and_stash_name(&mut second).expect("stash"), None);
    assert_eq!(creator.stashed_name(&second), None);
    let reloaded = store.load("b", None).expect("reload");
    assert_eq!(reloaded.get(STASH_KEY), None);
}

#[test]
fn year_sharded_names_carry_the_year() {
    let (_temp, db_path) = migrated_db();
    let mut config = enabled_config("~$2-$1");
    config.temp_user.serial_provider.use_year = true;
    let clock = Arc::new(FixedClock::default());
    let creator = TempUserCreator::local(&db_path, &config, clock.clone()).expect("creator");

    let status = creator.create(None, None).expect("create");
    assert_eq!(status.user.map(|user| user.name), Some("~2024-1".to_string()));
    assert_eq!(creator.placeholder_name().expect("placeholder"), "~2024-*");

    clock.advance(366 * 24 * 3600);
    let status = creator.create(None, None).expect("create");
    assert_eq!(status.user.map(|user| user.name), Some("~2025-1".to_string()));

    let connection = open_connection(&db_path).expect("open");
    let years: Vec<i32> = load_shard_counters(&connection)
        .expect("counters")
        .iter()
        .map(|counter| counter.year)
        .collect();
    assert_eq!(years, vec![2024, 2025]);
}

#[test]
fn disabled_config_refuses_generation() {
    let (_temp, db_path) = migrated_db();
    let creator = TempUserCreator::local(
        &db_path,
        &ToolConfig::default(),
        Arc::new(FixedClock::default()),
    )
    .expect("creator");

    assert!(!creator.is_enabled());
    assert!(!creator.is_auto_create_action("edit"));
    assert!(!creator.is_reserved_name("~1"));
    assert!(matches!(
        creator.placeholder_name(),
        Err(TempUserError::Disabled(_))
    ));
    let err = creator.create(None, None).expect_err("must fail");
    assert!(matches!(
        err.downcast_ref::<TempUserError>(),
        Some(TempUserError::Disabled(_))
    ));
    assert_eq!(counter_total(&db_path), 0);
}
