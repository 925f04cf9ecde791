//! Contract over the transactional row store backing the mutex, and its
//! Cloud Spanner implementation.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use google_cloud_gax::conn::Environment;
use google_cloud_gax::grpc::Status;
use google_cloud_gax::retry::TryAs;
use google_cloud_spanner::client::{Client, ClientConfig};
use google_cloud_spanner::key::Key;
use google_cloud_spanner::session::SessionError;
use google_cloud_spanner::transaction::Transaction;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::MutexConfig;
use crate::state::{DecodeError, MutexState};

/// Set to [`SPANNER_USE_EMULATOR_ENV_VAR_VALUE`] to talk to the Spanner
/// emulator with anonymous credentials instead of the real service.
pub const SPANNER_USE_EMULATOR_ENV_VAR: &str = "SPANNER_USE_EMULATOR";
pub const SPANNER_USE_EMULATOR_ENV_VAR_VALUE: &str = "YES";
/// Emulator address, `host:port`.
pub const SPANNER_EMULATOR_HOST_ENV_VAR: &str = "SPANNER_EMULATOR_HOST";
pub const GOOGLE_CLOUD_PROJECT_ENV_VAR: &str = "GOOGLE_CLOUD_PROJECT";

const DEFAULT_SPANNER_EMULATOR_HOST: &str = "0.0.0.0:9010";
const SPANNER_EMULATOR_PROJECT_NAME: &str = "spanner_emulator";

const CLIENT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(thiserror::Error, Debug)]
pub enum SpannerError {
    #[error(transparent)]
    Grpc(#[from] Status),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("could not create spanner client: {0}")]
    Client(#[from] google_cloud_spanner::client::Error),

    #[error("could not resolve google cloud credentials: {0}")]
    Auth(#[from] google_cloud_auth::error::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(
        "no project id: set 'project_id' in the mutex config or the \
         'GOOGLE_CLOUD_PROJECT' environment variable"
    )]
    MissingProjectId,
}

impl TryAs<Status> for SpannerError {
    fn try_as(&self) -> Option<&Status> {
        match self {
            SpannerError::Grpc(status) => Some(status),
            SpannerError::Client(google_cloud_spanner::client::Error::GRPC(status)) => Some(status),
            _ => None,
        }
    }
}

/// Server-side predicate of a conditional upsert, called with the row
/// the transaction read (if any) and the candidate row. Shared, since
/// an aborted transaction re-runs it against the re-read row.
pub type UpsertGuard = Arc<dyn Fn(Option<&MutexState>, &MutexState) -> bool + Send + Sync>;

/// The primitives the mutex needs from a transactional row store, and
/// nothing more.
///
/// The only concurrency guarantee the protocol relies on is that the
/// keyed read and the conditional write inside [`conditional_upsert`]
/// are serializable with respect to any other conditional upsert on the
/// same key.
///
/// [`conditional_upsert`]: RowStore::conditional_upsert
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Snapshot read of the mutex row, outside any transaction. `None`
    /// when the row was never written.
    async fn read_state(&self, mutex_uuid: Uuid) -> Result<Option<MutexState>, SpannerError>;

    /// Reads the current row inside a read-write transaction, applies
    /// `can_upsert` to it and the candidate, and commits the
    /// insert-or-update only when the guard passes. The committed row
    /// carries the transaction's commit timestamp in `update_time_utc`.
    ///
    /// `Ok(false)` means the guard rejected the write; only
    /// infrastructure failures are errors.
    async fn conditional_upsert(
        &self,
        candidate: &MutexState,
        can_upsert: UpsertGuard,
    ) -> Result<bool, SpannerError>;

    /// Probes that the instance, database and table are reachable.
    async fn validate(&self) -> Result<(), SpannerError>;
}

/// [`RowStore`] over a Cloud Spanner table.
pub struct SpannerStore {
    client: Client,
    table_id: String,
}

impl SpannerStore {
    /// Connects to the database named by `config`, reusing a cached
    /// client when a fresh enough one exists for the same database.
    pub async fn connect(config: &MutexConfig) -> Result<SpannerStore, SpannerError> {
        let database = database_path(config)?;
        let client = cached_client(&database).await?;
        Ok(SpannerStore {
            client,
            table_id: config.table_id.clone(),
        })
    }
}

#[async_trait]
impl RowStore for SpannerStore {
    async fn read_state(&self, mutex_uuid: Uuid) -> Result<Option<MutexState>, SpannerError> {
        let mut tx = self.client.single().await?;
        let row = tx
            .read_row(
                &self.table_id,
                &MutexState::COLUMNS,
                Key::new(&mutex_uuid.to_string()),
            )
            .await?;
        Ok(row.as_ref().map(MutexState::from_row).transpose()?)
    }

    async fn conditional_upsert(
        &self,
        candidate: &MutexState,
        can_upsert: UpsertGuard,
    ) -> Result<bool, SpannerError> {
        let result: Result<(_, bool), SpannerError> = self
            .client
            .read_write_transaction(|tx| {
                // The transaction function may run more than once, so the
                // future owns per-attempt copies.
                let table_id = self.table_id.clone();
                let candidate = candidate.clone();
                let can_upsert = Arc::clone(&can_upsert);
                Box::pin(async move {
                    let current = read_current(tx, &table_id, candidate.uuid).await?;
                    if !can_upsert(current.as_ref(), &candidate) {
                        tracing::debug!(
                            mutex_uuid = %candidate.uuid,
                            candidate_status = %candidate.status,
                            "conditional upsert rejected by guard"
                        );
                        return Ok(false);
                    }
                    tx.buffer_write(vec![candidate.insert_or_update(&table_id)]);
                    Ok(true)
                })
            })
            .await;
        let (_, committed) = result?;
        Ok(committed)
    }

    async fn validate(&self) -> Result<(), SpannerError> {
        let mut tx = self.client.single().await?;
        // A keyed read of a key that cannot exist exercises instance,
        // database, table and column layout in one call.
        tx.read_row(
            &self.table_id,
            &MutexState::COLUMNS,
            Key::new(&Uuid::nil().to_string()),
        )
        .await?;
        Ok(())
    }
}

async fn read_current(
    tx: &mut Transaction,
    table_id: &str,
    mutex_uuid: Uuid,
) -> Result<Option<MutexState>, SpannerError> {
    let mut rows = tx
        .read(
            table_id,
            &MutexState::COLUMNS,
            Key::new(&mutex_uuid.to_string()),
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(MutexState::from_row(&row)?)),
        None => Ok(None),
    }
}

struct CachedClient {
    client: Client,
    created_at: Instant,
}

fn client_cache() -> &'static Mutex<HashMap<String, CachedClient>> {
    static CACHE: OnceLock<Mutex<HashMap<String, CachedClient>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Clients are cached per database path so concurrent controllers in
/// one process share session pools. A lost race simply builds one extra
/// client, which then replaces the cached one.
async fn cached_client(database: &str) -> Result<Client, SpannerError> {
    if let Some(cached) = client_cache().lock().get(database) {
        if cached.created_at.elapsed() < CLIENT_CACHE_TTL {
            return Ok(cached.client.clone());
        }
    }
    tracing::debug!(database, "creating spanner client");
    let client = Client::new(database, spanner_client_config().await?).await?;
    client_cache().lock().insert(
        database.to_string(),
        CachedClient {
            client: client.clone(),
            created_at: Instant::now(),
        },
    );
    Ok(client)
}

fn use_emulator() -> bool {
    env::var(SPANNER_USE_EMULATOR_ENV_VAR)
        .map(|value| value == SPANNER_USE_EMULATOR_ENV_VAR_VALUE)
        .unwrap_or(false)
}

async fn spanner_client_config() -> Result<ClientConfig, SpannerError> {
    if use_emulator() {
        let host = env::var(SPANNER_EMULATOR_HOST_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_SPANNER_EMULATOR_HOST.to_string());
        tracing::debug!(host, "using the spanner emulator");
        Ok(ClientConfig {
            environment: Environment::Emulator(host),
            ..Default::default()
        })
    } else {
        Ok(ClientConfig::default().with_auth().await?)
    }
}

fn database_path(config: &MutexConfig) -> Result<String, SpannerError> {
    let project_id = if use_emulator() {
        SPANNER_EMULATOR_PROJECT_NAME.to_string()
    } else {
        match &config.project_id {
            Some(project_id) => project_id.clone(),
            None => {
                env::var(GOOGLE_CLOUD_PROJECT_ENV_VAR).map_err(|_| SpannerError::MissingProjectId)?
            }
        }
    };
    Ok(format!(
        "projects/{}/instances/{}/databases/{}",
        project_id, config.instance_id, config.database_id
    ))
}
