//! Tunable constants for the coordination core.
//!
//! Mirrors the flat, `serde`-derived, `Default`-backed configuration shape
//! used for blockchain-layer tuning elsewhere in this codebase's lineage
//! (block timing, network limits): a handful of named durations and
//! retry/backoff knobs instead of a full layered config framework, which
//! this core's surface area doesn't need.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default session lease length granted by [`try_begin_session`] when the
/// caller doesn't pick one explicitly.
///
/// [`try_begin_session`]: https://docs.rs/ensemble-coordination (session manager)
pub const DEFAULT_LEASE_MILLIS: u64 = 30_000;

/// Fraction of the lease interval at which [`crate::config::CoordConfig`]
/// recommends renewing — half the lease, per the session-owner renewal
/// rule.
pub const LEASE_RENEWAL_FRACTION: f64 = 0.5;

/// How often the session manager's background loop re-scans for expired
/// leases when nothing shorter is already scheduled.
pub const DEFAULT_LEASE_POLL: Duration = Duration::from_secs(1);

/// Initial backoff between CAS retry attempts in the lock manager's
/// write/read acquisition loops.
pub const DEFAULT_CAS_RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound on CAS retry backoff (exponential, capped).
pub const MAX_CAS_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Coordination-core tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordConfig {
    /// Lease length granted to new sessions that don't request one.
    pub default_lease: Duration,
    /// Interval at which the session manager re-scans for lease expiry.
    pub lease_poll_interval: Duration,
    /// Initial CAS retry backoff in the lock manager.
    pub cas_retry_backoff: Duration,
    /// Maximum CAS retry backoff.
    pub max_cas_retry_backoff: Duration,
    /// How long `wait_for_write_lock_release`/`wait_for_read_locks_release`
    /// wait on a notification before re-checking the holder's lease.
    pub lock_wait_poll: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_millis(DEFAULT_LEASE_MILLIS),
            lease_poll_interval: DEFAULT_LEASE_POLL,
            cas_retry_backoff: DEFAULT_CAS_RETRY_BACKOFF,
            max_cas_retry_backoff: MAX_CAS_RETRY_BACKOFF,
            lock_wait_poll: Duration::from_millis(500),
        }
    }
}

impl CoordConfig {
    /// The renewal interval a session owner should use: half the lease,
    /// per spec.
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs_f64(self.default_lease.as_secs_f64() * LEASE_RENEWAL_FRACTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_is_half_lease() {
        let config = CoordConfig::default();
        assert_eq!(
            config.renewal_interval(),
            Duration::from_millis(DEFAULT_LEASE_MILLIS / 2)
        );
    }
}
