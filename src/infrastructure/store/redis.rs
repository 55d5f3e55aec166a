//! Redis connection store
//!
//! Ownership bindings live under `conn:{chargePointId}` with a millisecond
//! TTL. Claim uses `SET NX PX`; renew and release are compare-and-swap Lua
//! scripts so a binding can only be refreshed or deleted by its owner.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use crate::application::ports::{ClaimOutcome, ConnectionStore, RenewOutcome};
use crate::support::errors::StoreError;

use super::ownership_key;

/// `PEXPIRE` only if the key still names this gateway.
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// `DEL` only if the key still names this gateway.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

pub struct RedisConnectionStore {
    conn: ConnectionManager,
    renew_script: Script,
    release_script: Script,
}

impl RedisConnectionStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!(url, "connected to connection store");
        Ok(Self {
            conn,
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl ConnectionStore for RedisConnectionStore {
    async fn claim(
        &self,
        charge_point_id: &str,
        gateway_id: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let key = ownership_key(charge_point_id);
        let mut conn = self.conn.clone();

        // Two attempts cover the race where the old binding expires between
        // the failed SET and the GET.
        for _ in 0..2 {
            let set: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(gateway_id)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            if set.is_some() {
                return Ok(ClaimOutcome::Claimed);
            }

            let owner: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            if let Some(owner) = owner {
                return Ok(ClaimOutcome::AlreadyOwned { owner });
            }
        }

        Ok(ClaimOutcome::AlreadyOwned {
            owner: String::new(),
        })
    }

    async fn renew(
        &self,
        charge_point_id: &str,
        gateway_id: &str,
        ttl: Duration,
    ) -> Result<RenewOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .renew_script
            .key(ownership_key(charge_point_id))
            .arg(gateway_id)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(if refreshed == 1 {
            RenewOutcome::Renewed
        } else {
            RenewOutcome::Lost
        })
    }

    async fn release(&self, charge_point_id: &str, gateway_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(ownership_key(charge_point_id))
            .arg(gateway_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn lookup(&self, charge_point_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(ownership_key(charge_point_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}
