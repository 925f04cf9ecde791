//! The mutex controller: the acquisition loop and its release
//! semantics.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::MutexConfig;
use crate::decision;
use crate::state::{MutexState, MutexStatus};
use crate::store::{RowStore, SpannerError, SpannerStore, UpsertGuard};

/// Error type of the user-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The work protected by the mutex, supplied by the caller.
///
/// Both hooks must tolerate the rare case of two clients running the
/// critical section concurrently: a holder stalled past its lease can
/// overlap with its successor, so the work should be idempotent.
#[async_trait]
pub trait CriticalSection: Send + Sync {
    /// Whether the critical section still has to run. Usually either
    /// "has the work been done yet" or, when the work depends on an
    /// external factor, "is there anything to do right now". Called at
    /// least once per acquisition cycle; returning `false` ends the
    /// loop.
    async fn is_mutex_needed(&self) -> Result<bool, BoxError>;

    /// Runs the protected work. `max_end_time` is the time budget: once
    /// it passes, other clients may assume this one failed and take
    /// over. The deadline is advisory, nothing cancels the work.
    async fn execute_critical_section(&self, max_end_time: OffsetDateTime)
        -> Result<(), BoxError>;
}

#[derive(thiserror::Error, Debug)]
pub enum MutexError {
    #[error("spanner infrastructure behind the mutex is not ready: {0}")]
    Validation(#[source] SpannerError),

    #[error("could not read mutex state: {0}")]
    State(#[source] SpannerError),

    #[error("could not check whether the mutex is needed: {0}")]
    IsMutexNeeded(#[source] BoxError),

    #[error("critical section failed: {0}")]
    CriticalSection(#[source] BoxError),

    #[error(
        "mutex release to '{status}' was rejected, the row no longer belongs to client '{client_uuid}'"
    )]
    ReleaseRejected {
        status: MutexStatus,
        client_uuid: Uuid,
    },

    #[error("could not release mutex to '{status}': {source}")]
    Release {
        status: MutexStatus,
        #[source]
        source: SpannerError,
    },

    #[error("{release}; the critical section had already failed: {critical_section}")]
    ReleaseAfterFailure {
        #[source]
        release: Box<MutexError>,
        critical_section: BoxError,
    },
}

/// Identity of one mutex client.
///
/// The protocol treats "same client UUID" as "me", so the UUID must be
/// unique per concurrent execution unit (thread, task or process);
/// sharing one across units breaks safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub uuid: Uuid,
    pub display_name: String,
}

impl ClientIdentity {
    pub fn new(uuid: Uuid, display_name: impl Into<String>) -> ClientIdentity {
        ClientIdentity {
            uuid,
            display_name: display_name.into(),
        }
    }

    /// Fresh random identity; the display name defaults to the UUID.
    pub fn generate() -> ClientIdentity {
        let uuid = Uuid::new_v4();
        ClientIdentity {
            uuid,
            display_name: uuid.to_string(),
        }
    }
}

/// Distributed mutex over a transactional row store.
///
/// Many clients, spread over tasks, processes and hosts, share one
/// mutex row keyed by `config.mutex_uuid`; [`start`] arbitrates which
/// of them runs the critical section. Coordination happens exclusively
/// through guarded read-modify-write transactions on that row, so the
/// controllers share no memory.
///
/// [`start`]: SpannerMutex::start
pub struct SpannerMutex<C> {
    config: MutexConfig,
    client: ClientIdentity,
    hook: C,
    store: Arc<dyn RowStore>,
    clock: Arc<dyn Clock>,
    rng: Arc<Mutex<StdRng>>,
}

impl<C> SpannerMutex<C>
where
    C: CriticalSection,
{
    /// Connects to Spanner and builds a controller. Without an explicit
    /// identity a fresh one is generated, which keeps the controller
    /// safe to run next to any other; pass `identity` only when you
    /// need recognizable client labels in the table.
    pub async fn new(
        config: MutexConfig,
        identity: Option<ClientIdentity>,
        hook: C,
    ) -> Result<SpannerMutex<C>, SpannerError> {
        let store = Arc::new(SpannerStore::connect(&config).await?);
        Ok(Self::with_store(config, identity, hook, store))
    }

    /// Builds a controller over an explicit row store.
    pub fn with_store(
        config: MutexConfig,
        identity: Option<ClientIdentity>,
        hook: C,
        store: Arc<dyn RowStore>,
    ) -> SpannerMutex<C> {
        let client = identity.unwrap_or_else(ClientIdentity::generate);
        tracing::debug!(
            mutex_uuid = %config.mutex_uuid,
            client_uuid = %client.uuid,
            client = %client.display_name,
            "creating mutex client"
        );
        SpannerMutex {
            config,
            client,
            hook,
            store,
            clock: Arc::new(SystemClock),
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> SpannerMutex<C> {
        self.clock = clock;
        self
    }

    /// Seeds the jitter source, for deterministic tests.
    pub fn with_rng_seed(mut self, seed: u64) -> SpannerMutex<C> {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    pub fn client_uuid(&self) -> Uuid {
        self.client.uuid
    }

    pub fn client_display_name(&self) -> &str {
        &self.client.display_name
    }

    /// Checks that the Spanner infrastructure behind the mutex is
    /// ready: instance, database and table all reachable.
    ///
    /// With `raise_if_invalid` any failure is returned as
    /// [`MutexError::Validation`]; otherwise it is logged and `false`
    /// is returned.
    pub async fn validate(&self, raise_if_invalid: bool) -> Result<bool, MutexError> {
        match self.store.validate().await {
            Ok(()) => Ok(true),
            Err(err) if raise_if_invalid => Err(MutexError::Validation(err)),
            Err(err) => {
                tracing::error!(mutex = %self, error = %err, "could not validate the mutex table");
                Ok(false)
            }
        }
    }

    /// Current mutex status. `Unknown` when no client wrote the row
    /// yet. Never mutates state.
    pub async fn status(&self) -> Result<MutexStatus, MutexError> {
        Ok(self
            .read_state()
            .await?
            .map(|state| state.status)
            .unwrap_or_default())
    }

    /// Runs the acquisition loop until the critical section was
    /// executed by this client (`Ok(true)`), the work became
    /// unnecessary, or the retry budget ran out (both `Ok(false)`;
    /// exhaustion is logged, callers inspect [`status`] when they need
    /// to tell the cases apart).
    ///
    /// A failing critical section is recorded as `failed` in the table
    /// before the error surfaces.
    ///
    /// [`status`]: SpannerMutex::status
    pub async fn start(&mut self) -> Result<bool, MutexError> {
        let mut retries: u32 = 0;
        while self.safe_is_mutex_needed().await? {
            if retries >= self.config.mutex_max_retries {
                tracing::error!(
                    mutex = %self,
                    retries,
                    "giving up on the mutex, retries exhausted"
                );
                return Ok(false);
            }
            let state = self.read_state().await?;
            tracing::debug!(mutex = %self, state = ?state, "current mutex state");
            if self.should_try_to_acquire(state.as_ref()) && self.acquire().await {
                tracing::info!(mutex = %self, "mutex acquired, executing critical section");
                match self.safe_execute_critical_section().await {
                    Ok(()) => {
                        self.release(None).await?;
                        tracing::info!(
                            mutex = %self,
                            "critical section executed and mutex released"
                        );
                        return Ok(true);
                    }
                    Err(err) => {
                        tracing::error!(
                            mutex = %self,
                            error = %err,
                            "critical section failed, recording the failure"
                        );
                        // Always fails: either with the release problem
                        // or with the critical-section error itself.
                        self.release(Some(err)).await?;
                        return Ok(false);
                    }
                }
            }
            tracing::debug!(
                mutex = %self,
                wait_in_secs = self.config.mutex_wait_time_in_secs,
                "waiting for the next mutex cycle"
            );
            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.mutex_wait_time_in_secs as u64,
            ))
            .await;
            retries += 1;
        }
        tracing::info!(mutex = %self, "mutex is not needed anymore");
        Ok(false)
    }

    async fn read_state(&self) -> Result<Option<MutexState>, MutexError> {
        self.store
            .read_state(self.config.mutex_uuid)
            .await
            .map_err(MutexError::State)
    }

    fn should_try_to_acquire(&self, state: Option<&MutexState>) -> bool {
        let mut rng = self.rng.lock();
        decision::should_try_to_acquire(&self.config, state, self.clock.now_utc(), &mut *rng)
    }

    /// Optimistically checked by the caller, authoritatively re-checked
    /// by the store inside its transaction.
    fn upsert_guard(&self) -> UpsertGuard {
        let config = self.config.clone();
        let clock = Arc::clone(&self.clock);
        let rng = Arc::clone(&self.rng);
        Arc::new(move |current, candidate| {
            let mut rng = rng.lock();
            decision::can_upsert(&config, current, candidate, clock.now_utc(), &mut *rng)
        })
    }

    async fn acquire(&self) -> bool {
        let candidate = self.create_state(MutexStatus::Started);
        match self
            .store
            .conditional_upsert(&candidate, self.upsert_guard())
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::info!(mutex = %self, error = %err, "could not acquire the mutex");
                false
            }
        }
    }

    /// Writes `done` (no error) or `failed` through the same guard as
    /// acquisition. A rejected release means a peer already took the
    /// row over; that surfaces as an error on purpose, so the caller
    /// knows the row no longer represents this execution.
    async fn release(&self, error: Option<BoxError>) -> Result<(), MutexError> {
        let status = if error.is_some() {
            MutexStatus::Failed
        } else {
            MutexStatus::Done
        };
        let candidate = self.create_state(status);
        match self
            .store
            .conditional_upsert(&candidate, self.upsert_guard())
            .await
        {
            Ok(true) => match error {
                None => Ok(()),
                Some(cause) => Err(MutexError::CriticalSection(cause)),
            },
            Ok(false) => Err(chain_release_failure(
                MutexError::ReleaseRejected {
                    status,
                    client_uuid: self.client.uuid,
                },
                error,
            )),
            Err(source) => Err(chain_release_failure(
                MutexError::Release { status, source },
                error,
            )),
        }
    }

    fn create_state(&self, status: MutexStatus) -> MutexState {
        MutexState {
            uuid: self.config.mutex_uuid,
            display_name: self.config.display_name(),
            status,
            // Placeholder only, the store writes the commit timestamp.
            update_time_utc: self.clock.now_utc(),
            update_client_uuid: self.client.uuid,
            update_client_display_name: self.client.display_name.clone(),
        }
    }

    fn max_end_time(&self) -> OffsetDateTime {
        self.clock.now_utc() + Duration::seconds(self.config.mutex_ttl_in_secs)
    }

    async fn safe_is_mutex_needed(&self) -> Result<bool, MutexError> {
        let started = Instant::now();
        let needed = self
            .hook
            .is_mutex_needed()
            .await
            .map_err(MutexError::IsMutexNeeded)?;
        tracing::debug!(
            mutex = %self,
            needed,
            elapsed = ?started.elapsed(),
            "checked whether the mutex is needed"
        );
        Ok(needed)
    }

    async fn safe_execute_critical_section(&self) -> Result<(), BoxError> {
        let max_end_time = self.max_end_time();
        let started = Instant::now();
        let result = self.hook.execute_critical_section(max_end_time).await;
        tracing::debug!(
            mutex = %self,
            ok = result.is_ok(),
            elapsed = ?started.elapsed(),
            "critical section returned"
        );
        result
    }
}

fn chain_release_failure(release: MutexError, critical_section: Option<BoxError>) -> MutexError {
    match critical_section {
        Some(critical_section) => MutexError::ReleaseAfterFailure {
            release: Box::new(release),
            critical_section,
        },
        None => release,
    }
}

impl<C> fmt::Display for SpannerMutex<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpannerMutex(mutex_uuid='{}', client_uuid='{}', client='{}')",
            self.config.mutex_uuid, self.client.uuid, self.client.display_name
        )
    }
}
