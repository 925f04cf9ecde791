use std::fmt;

use google_cloud_googleapis::spanner::v1::Mutation;
use google_cloud_spanner::mutation::insert_or_update;
use google_cloud_spanner::row::Row;
use google_cloud_spanner::statement::ToKind;
use google_cloud_spanner::value::CommitTimestamp;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Column(#[from] google_cloud_spanner::row::Error),

    #[error("column '{column}' holds '{value}', which is not a valid UUID: {source}")]
    Uuid {
        column: &'static str,
        value: String,
        #[source]
        source: uuid::Error,
    },
}

/// Supported mutex status.
///
/// `Unknown` is the wire representation of anything unrecognized, and
/// what `status()` reports when the row was never written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MutexStatus {
    Started,
    Done,
    Failed,
    #[default]
    Unknown,
}

impl MutexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutexStatus::Started => "started",
            MutexStatus::Done => "done",
            MutexStatus::Failed => "failed",
            MutexStatus::Unknown => "",
        }
    }

    /// Case-insensitive and total: unrecognized values map to `Unknown`.
    pub fn parse(value: &str) -> MutexStatus {
        match value.to_ascii_lowercase().as_str() {
            "started" => MutexStatus::Started,
            "done" => MutexStatus::Done,
            "failed" => MutexStatus::Failed,
            _ => MutexStatus::Unknown,
        }
    }
}

impl fmt::Display for MutexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the mutex table. Must stay in sync with the table schema:
///
/// ```sql
/// CREATE TABLE critical_section (
///     uuid STRING(36) NOT NULL,
///     display_name STRING(MAX),
///     status STRING(16),
///     update_time_utc TIMESTAMP OPTIONS (allow_commit_timestamp=true),
///     update_client_uuid STRING(36),
///     update_client_display_name STRING(MAX),
/// ) PRIMARY KEY (uuid)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexState {
    /// Primary key, equal to the mutex UUID in the config.
    pub uuid: Uuid,
    pub display_name: String,
    pub status: MutexStatus,
    /// Commit timestamp of the last write, assigned by Spanner.
    pub update_time_utc: OffsetDateTime,
    /// Identity of the client that wrote the row last.
    pub update_client_uuid: Uuid,
    pub update_client_display_name: String,
}

impl MutexState {
    pub const COLUMNS: [&'static str; 6] = [
        "uuid",
        "display_name",
        "status",
        "update_time_utc",
        "update_client_uuid",
        "update_client_display_name",
    ];

    /// Maps a row back to a state. This is where columns are bound to
    /// fields, so it must match [`MutexState::COLUMNS`].
    pub fn from_row(row: &Row) -> Result<MutexState, DecodeError> {
        Ok(MutexState {
            uuid: uuid_column(row, "uuid")?,
            display_name: row.column_by_name("display_name")?,
            status: MutexStatus::parse(&row.column_by_name::<String>("status")?),
            update_time_utc: row.column_by_name("update_time_utc")?,
            update_client_uuid: uuid_column(row, "update_client_uuid")?,
            update_client_display_name: row.column_by_name("update_client_display_name")?,
        })
    }

    /// Insert-or-update mutation for this state. `update_time_utc` is
    /// written as the commit-timestamp placeholder so the server assigns
    /// it; the local value of the field never reaches the table.
    pub fn insert_or_update(&self, table_id: &str) -> Mutation {
        insert_or_update(
            table_id,
            &Self::COLUMNS,
            &[
                &self.uuid.to_string() as &dyn ToKind,
                &self.display_name,
                &self.status.as_str(),
                &CommitTimestamp::new(),
                &self.update_client_uuid.to_string(),
                &self.update_client_display_name,
            ],
        )
    }
}

fn uuid_column(row: &Row, column: &'static str) -> Result<Uuid, DecodeError> {
    let value = row.column_by_name::<String>(column)?;
    Uuid::parse_str(&value).map_err(|source| DecodeError::Uuid {
        column,
        value,
        source,
    })
}
