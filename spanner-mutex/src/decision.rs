//! The predicate set driving acquisition and release.
//!
//! Everything here is a pure function of the config, the last observed
//! state, the current time and (for the watermark) a jitter draw, so
//! that the optimistic check a controller runs outside the transaction
//! and the authoritative [`can_upsert`] guard inside it evaluate
//! consistently.

use rand::Rng;
use time::{Duration, OffsetDateTime};

use crate::config::MutexConfig;
use crate::state::{MutexState, MutexStatus};

/// Share of the TTL used as the upper bound of the jitter.
const MUTEX_TTL_JITTER_IN_PERCENT: f64 = 0.05;

/// Uniform draw in `[0, max(1, ttl * 5%)]`, inclusive, fresh on every
/// evaluation.
///
/// The jitter desynchronizes clients that woke up in the same cycle and
/// doubles as a small grace period on top of the holder's TTL.
pub fn jitter_in_secs<R: Rng + ?Sized>(ttl_in_secs: i64, rng: &mut R) -> i64 {
    let max_jitter = ((ttl_in_secs as f64) * MUTEX_TTL_JITTER_IN_PERCENT) as i64;
    rng.gen_range(0..=max_jitter.max(1))
}

/// The state is abandoned: absent, or last written longer than the
/// staleness horizon ago, whatever its status says.
pub fn is_state_stale(
    config: &MutexConfig,
    state: Option<&MutexState>,
    now_utc: OffsetDateTime,
) -> bool {
    match state {
        None => true,
        Some(state) => {
            state.update_time_utc + Duration::seconds(config.mutex_staleness_in_secs) < now_utc
        }
    }
}

/// The holder's lease ran out: absent, or `update_time_utc + ttl +
/// jitter` lies in the past. With `just_jitter` only the jitter is
/// applied.
pub fn is_watermark_breached<R: Rng + ?Sized>(
    config: &MutexConfig,
    state: Option<&MutexState>,
    now_utc: OffsetDateTime,
    rng: &mut R,
    just_jitter: bool,
) -> bool {
    let Some(state) = state else {
        return true;
    };
    let mut window = jitter_in_secs(config.mutex_ttl_in_secs, rng);
    if !just_jitter {
        window += config.mutex_ttl_in_secs;
    }
    state.update_time_utc + Duration::seconds(window) < now_utc
}

/// Whether the state exists and carries the given status.
pub fn is_status(state: Option<&MutexState>, status: MutexStatus) -> bool {
    state.map_or(false, |state| state.status == status)
}

/// A client should try to acquire when nobody wrote yet, when the last
/// write is stale, or when the row is neither done nor held and the
/// watermark is breached.
///
/// A non-stale `started` row is never preempted here, even past its
/// TTL: only the staleness horizon reclaims a holder that went away,
/// and a non-stale `done` row means the work already happened.
pub fn should_try_to_acquire<R: Rng + ?Sized>(
    config: &MutexConfig,
    state: Option<&MutexState>,
    now_utc: OffsetDateTime,
    rng: &mut R,
) -> bool {
    if state.is_none() {
        return true;
    }
    if is_state_stale(config, state, now_utc) {
        return true;
    }
    !is_status(state, MutexStatus::Done)
        && !is_status(state, MutexStatus::Started)
        && is_watermark_breached(config, state, now_utc, rng, false)
}

/// The authoritative guard, evaluated against the row a read-write
/// transaction just read.
///
/// A client may always move its own row to a different status (e.g.
/// `started` to `done`); anyone may write when [`should_try_to_acquire`]
/// holds for the current row.
pub fn can_upsert<R: Rng + ?Sized>(
    config: &MutexConfig,
    current: Option<&MutexState>,
    candidate: &MutexState,
    now_utc: OffsetDateTime,
    rng: &mut R,
) -> bool {
    if let Some(current) = current {
        if current.update_client_uuid == candidate.update_client_uuid
            && current.status != candidate.status
        {
            return true;
        }
    }
    should_try_to_acquire(config, current, now_utc, rng)
}
