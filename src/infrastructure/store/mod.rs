//! Connection-store backends
//!
//! `conn:{chargePointId}` → gateway ID with TTL. Redis in production, an
//! in-memory twin for tests.

pub mod memory;
pub mod redis;

/// Key layout shared by every backend.
pub(crate) fn ownership_key(charge_point_id: &str) -> String {
    format!("conn:{charge_point_id}")
}
