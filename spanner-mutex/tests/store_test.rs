//! Round-trips against the Spanner emulator. The emulator must be
//! running and the mutex table created first:
//!
//! ```sql
//! CREATE TABLE critical_section (
//!     uuid STRING(36) NOT NULL,
//!     display_name STRING(MAX),
//!     status STRING(16),
//!     update_time_utc TIMESTAMP OPTIONS (allow_commit_timestamp=true),
//!     update_client_uuid STRING(36),
//!     update_client_display_name STRING(MAX),
//! ) PRIMARY KEY (uuid)
//! ```

use std::sync::Arc;

use serial_test::serial;
use spanner_mutex::config::MutexConfig;
use spanner_mutex::state::{MutexState, MutexStatus};
use spanner_mutex::store::{RowStore, SpannerStore, UpsertGuard};
use time::OffsetDateTime;
use uuid::Uuid;

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt().try_init();
}

fn emulator_config(mutex_uuid: Uuid) -> MutexConfig {
    std::env::set_var("SPANNER_USE_EMULATOR", "YES");
    std::env::set_var("SPANNER_EMULATOR_HOST", "localhost:9010");
    MutexConfig {
        mutex_uuid,
        instance_id: "test-instance".to_string(),
        database_id: "local-database".to_string(),
        table_id: "critical_section".to_string(),
        project_id: None,
        mutex_display_name: Some("emulator-test".to_string()),
        mutex_ttl_in_secs: 60,
        mutex_wait_time_in_secs: 1,
        mutex_staleness_in_secs: 600,
        mutex_max_retries: 5,
    }
}

fn state(mutex_uuid: Uuid, status: MutexStatus, client_uuid: Uuid) -> MutexState {
    MutexState {
        uuid: mutex_uuid,
        display_name: "emulator-test".to_string(),
        status,
        update_time_utc: OffsetDateTime::now_utc(),
        update_client_uuid: client_uuid,
        update_client_display_name: "store-test".to_string(),
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires a running spanner emulator on localhost:9010 with the mutex table created"]
async fn guarded_upsert_round_trip() {
    let mutex_uuid = Uuid::new_v4();
    let config = emulator_config(mutex_uuid);
    let store = SpannerStore::connect(&config).await.unwrap();
    store.validate().await.unwrap();

    assert_eq!(store.read_state(mutex_uuid).await.unwrap(), None);

    // First writer gets the row.
    let only_if_absent: UpsertGuard = Arc::new(|current, _| current.is_none());
    let me = Uuid::new_v4();
    let acquired = store
        .conditional_upsert(
            &state(mutex_uuid, MutexStatus::Started, me),
            Arc::clone(&only_if_absent),
        )
        .await
        .unwrap();
    assert!(acquired);

    let row = store.read_state(mutex_uuid).await.unwrap().unwrap();
    assert_eq!(row.status, MutexStatus::Started);
    assert_eq!(row.update_client_uuid, me);
    // The commit timestamp came from the server, not from the state we
    // sent.
    assert!(row.update_time_utc <= OffsetDateTime::now_utc());

    // A second blind insert is rejected by the same guard.
    let rejected = store
        .conditional_upsert(
            &state(mutex_uuid, MutexStatus::Started, Uuid::new_v4()),
            only_if_absent,
        )
        .await
        .unwrap();
    assert!(!rejected);

    // The holder moves its own row forward.
    let own_row: UpsertGuard = Arc::new(|current: Option<&MutexState>, candidate: &MutexState| {
        current.is_some_and(|current| current.update_client_uuid == candidate.update_client_uuid)
    });
    let released = store
        .conditional_upsert(&state(mutex_uuid, MutexStatus::Done, me), own_row)
        .await
        .unwrap();
    assert!(released);

    let row = store.read_state(mutex_uuid).await.unwrap().unwrap();
    assert_eq!(row.status, MutexStatus::Done);
    assert_eq!(row.update_client_uuid, me);
}

#[tokio::test]
#[serial]
#[ignore = "requires a running spanner emulator on localhost:9010 with the mutex table created"]
async fn validate_fails_for_a_missing_table() {
    let mut config = emulator_config(Uuid::new_v4());
    config.table_id = "no_such_table".to_string();
    let store = SpannerStore::connect(&config).await.unwrap();
    assert!(store.validate().await.is_err());
}
