#![allow(clippy::result_large_err)]
//! # spanner-mutex
//!
//! Distributed critical section (mutex) backed by Google Cloud Spanner.
//!
//! Many clients, spread over tasks, processes and hosts, coordinate
//! through a single Spanner row so that at most one of them at a time
//! runs a user-supplied critical section, and so that another client
//! eventually takes over when the holder goes away.
//!
//! ## Quickstart
//!
//! Implement [`mutex::CriticalSection`] for the protected work and hand
//! it to a [`mutex::SpannerMutex`]:
//!
//! ```
//! use spanner_mutex::config::MutexConfig;
//! use spanner_mutex::mutex::{BoxError, CriticalSection, SpannerMutex};
//! use time::OffsetDateTime;
//!
//! struct NightlyExport;
//!
//! #[async_trait::async_trait]
//! impl CriticalSection for NightlyExport {
//!     async fn is_mutex_needed(&self) -> Result<bool, BoxError> {
//!         // e.g. check whether today's export already exists
//!         Ok(true)
//!     }
//!
//!     async fn execute_critical_section(
//!         &self,
//!         max_end_time: OffsetDateTime,
//!     ) -> Result<(), BoxError> {
//!         // do the work, aiming to finish before `max_end_time`
//!         Ok(())
//!     }
//! }
//!
//! async fn run() -> Result<(), BoxError> {
//!     let config = MutexConfig::from_json_file("mutex.json")?;
//!     let mut mutex = SpannerMutex::new(config, None, NightlyExport).await?;
//!     let executed = mutex.start().await?;
//!     println!("executed by this client: {executed}");
//!     Ok(())
//! }
//! ```
//!
//! ## Table schema
//!
//! The mutex table must exist before any client starts (schema
//! management is deliberately out of scope here):
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
//!
//! `update_time_utc` is always the commit timestamp Spanner assigned to
//! the write, never a client clock value. One table can hold any number
//! of mutexes, one row per mutex UUID.
//!
//! ## How arbitration works
//!
//! Every client runs the same loop: snapshot-read the row, decide
//! whether to try to acquire, and if so upsert a `started` row through
//! a read-write transaction that re-reads the row and re-checks the
//! decision against it. That guarded upsert is the only concurrency
//! primitive the protocol needs; Spanner serializes it against every
//! other guarded upsert on the same row.
//!
//! Timing is governed by three knobs on [`config::MutexConfig`]:
//!
//! * **TTL** - the lease: how long the holder is presumed alive. Once
//!   `update_time_utc + ttl + jitter` has passed, `failed` and unknown
//!   rows can be taken over.
//! * **Staleness** - the horizon after which any row, whatever its
//!   status, counts as abandoned and is fair game. It must exceed both
//!   the TTL and the whole retry window.
//! * **Jitter** - a small random addition (up to 5% of the TTL) to the
//!   lease comparison that desynchronizes clients retrying in lockstep.
//!
//! Note that a non-stale `started` row is never preempted at TTL, only
//! once it is stale; see `decision::should_try_to_acquire`.
//!
//! This is not strict leader election: a holder stalled past its lease
//! can overlap with its successor for a short window. Critical sections
//! that cannot tolerate that must be idempotent.
//!
//! ## Emulator
//!
//! Set `SPANNER_USE_EMULATOR=YES` to talk to a local emulator with
//! anonymous credentials (`SPANNER_EMULATOR_HOST` selects the address,
//! default `0.0.0.0:9010`), same as the other Google Cloud clients.

pub mod clock;
pub mod config;
pub mod decision;
pub mod mutex;
pub mod state;
pub mod store;
