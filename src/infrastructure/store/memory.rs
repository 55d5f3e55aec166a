//! In-memory connection store
//!
//! TTL-aware twin of the Redis backend for tests and single-node runs.
//! Atomicity comes from dashmap's per-key entry locking; expiry is driven
//! by the injected clock so tests can step time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::application::ports::{ClaimOutcome, ConnectionStore, RenewOutcome};
use crate::support::clock::SharedClock;
use crate::support::errors::StoreError;

use super::ownership_key;

#[derive(Debug, Clone)]
struct Binding {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl Binding {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct MemoryConnectionStore {
    bindings: DashMap<String, Binding>,
    clock: SharedClock,
}

impl MemoryConnectionStore {
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            bindings: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now_utc()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn claim(
        &self,
        charge_point_id: &str,
        gateway_id: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = self.clock.now_utc();
        let binding = Binding {
            owner: gateway_id.to_string(),
            expires_at: self.expiry(ttl),
        };

        match self.bindings.entry(ownership_key(charge_point_id)) {
            Entry::Vacant(slot) => {
                slot.insert(binding);
                Ok(ClaimOutcome::Claimed)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().expired(now) {
                    slot.insert(binding);
                    Ok(ClaimOutcome::Claimed)
                } else {
                    Ok(ClaimOutcome::AlreadyOwned {
                        owner: slot.get().owner.clone(),
                    })
                }
            }
        }
    }

    async fn renew(
        &self,
        charge_point_id: &str,
        gateway_id: &str,
        ttl: Duration,
    ) -> Result<RenewOutcome, StoreError> {
        let now = self.clock.now_utc();
        let expires_at = self.expiry(ttl);

        match self.bindings.entry(ownership_key(charge_point_id)) {
            Entry::Occupied(mut slot) if !slot.get().expired(now) => {
                if slot.get().owner == gateway_id {
                    slot.get_mut().expires_at = expires_at;
                    Ok(RenewOutcome::Renewed)
                } else {
                    Ok(RenewOutcome::Lost)
                }
            }
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn release(&self, charge_point_id: &str, gateway_id: &str) -> Result<(), StoreError> {
        self.bindings
            .remove_if(&ownership_key(charge_point_id), |_, binding| {
                binding.owner == gateway_id
            });
        Ok(())
    }

    async fn lookup(&self, charge_point_id: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_utc();
        Ok(self
            .bindings
            .get(&ownership_key(charge_point_id))
            .filter(|binding| !binding.expired(now))
            .map(|binding| binding.owner.clone()))
    }
}
