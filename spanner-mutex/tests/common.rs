#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use google_cloud_gax::grpc::{Code, Status};
use parking_lot::Mutex;
use spanner_mutex::config::MutexConfig;
use spanner_mutex::mutex::{BoxError, CriticalSection};
use spanner_mutex::state::{MutexState, MutexStatus};
use spanner_mutex::store::{RowStore, SpannerError, UpsertGuard};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub const MUTEX_UUID: &str = "f7f2d4b2-9c68-4a6f-9b3e-3f2c6a1d5e49";

/// Fast-cycling config: 60s TTL, 600s staleness, 1s wait, 5 retries.
pub fn test_config() -> MutexConfig {
    MutexConfig {
        mutex_uuid: Uuid::parse_str(MUTEX_UUID).unwrap(),
        instance_id: "test-instance".to_string(),
        database_id: "test-database".to_string(),
        table_id: "critical_section".to_string(),
        project_id: Some("test-project".to_string()),
        mutex_display_name: Some("test-mutex".to_string()),
        mutex_ttl_in_secs: 60,
        mutex_wait_time_in_secs: 1,
        mutex_staleness_in_secs: 600,
        mutex_max_retries: 5,
    }
}

/// Row written by some peer client `age_in_secs` ago.
pub fn peer_state(status: MutexStatus, age_in_secs: i64) -> MutexState {
    MutexState {
        uuid: Uuid::parse_str(MUTEX_UUID).unwrap(),
        display_name: "test-mutex".to_string(),
        status,
        update_time_utc: OffsetDateTime::now_utc() - Duration::seconds(age_in_secs),
        update_client_uuid: Uuid::new_v4(),
        update_client_display_name: "peer".to_string(),
    }
}

/// In-memory stand-in for the Spanner table: one row guarded the same
/// way the real store guards it, with the commit timestamp assigned at
/// commit time. The failure knobs emulate infrastructure errors.
pub struct FakeStore {
    row: Mutex<Option<MutexState>>,
    pub fail_reads: AtomicBool,
    /// Upsert attempts with an index at or past this value fail.
    pub fail_upserts_from: AtomicUsize,
    pub upsert_attempts: AtomicUsize,
}

impl FakeStore {
    pub fn empty() -> Arc<FakeStore> {
        Arc::new(FakeStore {
            row: Mutex::new(None),
            fail_reads: AtomicBool::new(false),
            fail_upserts_from: AtomicUsize::new(usize::MAX),
            upsert_attempts: AtomicUsize::new(0),
        })
    }

    pub fn seeded(state: MutexState) -> Arc<FakeStore> {
        let store = FakeStore::empty();
        store.set_row(Some(state));
        store
    }

    pub fn row(&self) -> Option<MutexState> {
        self.row.lock().clone()
    }

    pub fn set_row(&self, state: Option<MutexState>) {
        *self.row.lock() = state;
    }

    fn unavailable() -> SpannerError {
        SpannerError::Grpc(Status::new(Code::Unavailable, "fake store is down"))
    }
}

#[async_trait]
impl RowStore for FakeStore {
    async fn read_state(&self, _mutex_uuid: Uuid) -> Result<Option<MutexState>, SpannerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FakeStore::unavailable());
        }
        Ok(self.row())
    }

    async fn conditional_upsert(
        &self,
        candidate: &MutexState,
        can_upsert: UpsertGuard,
    ) -> Result<bool, SpannerError> {
        let attempt = self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.fail_upserts_from.load(Ordering::SeqCst) {
            return Err(FakeStore::unavailable());
        }
        let mut row = self.row.lock();
        if !can_upsert(row.as_ref(), candidate) {
            return Ok(false);
        }
        let mut committed = candidate.clone();
        committed.update_time_utc = OffsetDateTime::now_utc();
        *row = Some(committed);
        Ok(true)
    }

    async fn validate(&self) -> Result<(), SpannerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FakeStore::unavailable());
        }
        Ok(())
    }
}

/// Critical section that flips itself to "done" once executed, the way
/// a job checking for its own output would.
pub struct TestSection {
    done: AtomicBool,
    fail_message: Option<&'static str>,
    pub executions: AtomicUsize,
    pub needed_calls: AtomicUsize,
}

impl TestSection {
    pub fn new() -> TestSection {
        TestSection {
            done: AtomicBool::new(false),
            fail_message: None,
            executions: AtomicUsize::new(0),
            needed_calls: AtomicUsize::new(0),
        }
    }

    pub fn already_done() -> TestSection {
        let section = TestSection::new();
        section.done.store(true, Ordering::SeqCst);
        section
    }

    pub fn failing(message: &'static str) -> TestSection {
        TestSection {
            fail_message: Some(message),
            ..TestSection::new()
        }
    }
}

#[async_trait]
impl CriticalSection for TestSection {
    async fn is_mutex_needed(&self) -> Result<bool, BoxError> {
        self.needed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.done.load(Ordering::SeqCst))
    }

    async fn execute_critical_section(
        &self,
        _max_end_time: OffsetDateTime,
    ) -> Result<(), BoxError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        match self.fail_message {
            Some(message) => Err(message.into()),
            None => {
                self.done.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

/// Critical section whose needed-check always fails.
pub struct BrokenNeededCheck;

#[async_trait]
impl CriticalSection for BrokenNeededCheck {
    async fn is_mutex_needed(&self) -> Result<bool, BoxError> {
        Err("needed check exploded".into())
    }

    async fn execute_critical_section(
        &self,
        _max_end_time: OffsetDateTime,
    ) -> Result<(), BoxError> {
        unreachable!("never acquires");
    }
}

/// Critical section that hands the row to a peer while it runs, so the
/// release finds a row that no longer belongs to the caller.
pub struct StolenWhileRunning {
    pub store: Arc<FakeStore>,
}

#[async_trait]
impl CriticalSection for StolenWhileRunning {
    async fn is_mutex_needed(&self) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn execute_critical_section(
        &self,
        _max_end_time: OffsetDateTime,
    ) -> Result<(), BoxError> {
        self.store.set_row(Some(peer_state(MutexStatus::Started, 0)));
        Ok(())
    }
}
