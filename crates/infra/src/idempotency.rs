//! At-most-once execution guard for mutating operations.
//!
//! Flow (per client request):
//!   1. Client sends an `Idempotency-Key` header (UUID v4), validated
//!      before any ledger work begins.
//!   2. `lookup`: if `(key, principal)` was seen, replay the stored
//!      response verbatim and skip the business logic entirely.
//!   3. Otherwise run the operation, then `store` the response. The insert
//!      is guarded by a unique constraint: under a race of two identical
//!      requests exactly one store succeeds, and the loser just discards
//!      its duplicate.
//!
//! Only stable outcomes are stored (the caller decides stability; transient
//! failures stay uncached so a retry with the same key can succeed).
//! Records expire after a TTL and are purged by a background sweep, never
//! on the read path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::{Uuid, Version};

use velopay_auth::PrincipalId;
use velopay_core::DomainError;

use crate::store::{IdempotencyRecord, IdempotencyStore, StoreError};

/// Idempotency retention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Retention window. `VELOPAY_IDEMPOTENCY_TTL_SECONDS`, default 86400.
    pub ttl: Duration,
    /// Sweep cadence for the background purge task.
    pub purge_every: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            purge_every: Duration::from_secs(3_600),
        }
    }
}

impl IdempotencyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let ttl = std::env::var("VELOPAY_IDEMPOTENCY_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.ttl);
        Self { ttl, ..d }
    }
}

/// Validate a client-supplied idempotency key.
///
/// Must be a well-formed UUID **version 4**; anything else is a client
/// error raised before any business logic runs.
pub fn validate_key(raw: &str) -> Result<Uuid, DomainError> {
    let key = Uuid::parse_str(raw)
        .map_err(|_| DomainError::validation("Idempotency-Key must be a UUID v4"))?;
    if key.get_version() != Some(Version::Random) {
        return Err(DomainError::validation("Idempotency-Key must be a UUID v4"));
    }
    Ok(key)
}

/// A previously stored response, replayed verbatim on duplicate requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub code: u16,
    pub body: serde_json::Value,
}

/// Deduplicates client-submitted operations by `(key, principal)`.
#[derive(Debug)]
pub struct IdempotencyGuard<S> {
    store: S,
    config: IdempotencyConfig,
    /// In-process single-flight slots, so concurrent duplicates within one
    /// instance serialize instead of double-executing. Across instances
    /// the `(key, principal)` unique constraint still keeps one stored
    /// response.
    inflight: Mutex<HashMap<(Uuid, PrincipalId), Arc<Mutex<()>>>>,
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub fn new(store: S, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// The response previously stored for `(key, principal)`, if any.
    pub async fn lookup(
        &self,
        key: Uuid,
        principal: PrincipalId,
    ) -> Result<Option<StoredResponse>, StoreError> {
        let record = self.store.find(key, principal).await?;
        Ok(record.map(|r| StoredResponse {
            code: r.response_code,
            body: r.response_body,
        }))
    }

    /// Persist the first response for `(key, principal)`.
    ///
    /// Returns `false` when a concurrent request got there first; the
    /// caller keeps serving its own result and discards nothing visible to
    /// the client.
    pub async fn store(
        &self,
        key: Uuid,
        principal: PrincipalId,
        endpoint: &str,
        code: u16,
        body: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let stored = self
            .store
            .put_if_absent(IdempotencyRecord {
                key,
                principal,
                endpoint: endpoint.to_string(),
                response_code: code,
                response_body: body,
                created_at: Utc::now(),
            })
            .await?;

        if !stored {
            tracing::warn!(%key, %principal, "idempotency key collision; keeping first stored response");
        }

        Ok(stored)
    }

    /// Execute `op` at most once per `(key, principal)`.
    ///
    /// Replays the stored response when one exists; otherwise serializes
    /// concurrent duplicates in-process, runs `op`, and stores its result
    /// if `op` reports it as stable. `op` returns
    /// `(status_code, body, stable)`.
    pub async fn run<F, Fut>(
        &self,
        key: Uuid,
        principal: PrincipalId,
        endpoint: &str,
        op: F,
    ) -> Result<StoredResponse, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (u16, serde_json::Value, bool)>,
    {
        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry((key, principal)).or_default().clone()
        };
        let _serialized = slot.lock().await;

        if let Some(replay) = self.lookup(key, principal).await? {
            return Ok(replay);
        }

        let (code, body, stable) = op().await;
        if stable {
            // `false` here means a request on another instance won the
            // storage race; this caller still serves its own result.
            let _ = self.store(key, principal, endpoint, code, body.clone()).await?;
        }

        let mut inflight = self.inflight.lock().await;
        if let Some(current) = inflight.get(&(key, principal)) {
            if Arc::ptr_eq(current, &slot) {
                inflight.remove(&(key, principal));
            }
        }

        Ok(StoredResponse { code, body })
    }

    /// Delete records older than the TTL; returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::hours(24));
        self.store.purge_expired(cutoff).await
    }
}

/// Spawn the background expiry sweep.
///
/// Independent of request handling; a failed sweep only logs and retries on
/// the next tick.
pub fn spawn_purge_task<S>(guard: Arc<IdempotencyGuard<S>>) -> tokio::task::JoinHandle<()>
where
    S: IdempotencyStore + 'static,
{
    let every = guard.config().purge_every;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match guard.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(purged = n, "expired idempotency keys removed"),
                Err(e) => tracing::warn!(error = %e, "idempotency purge failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryIdempotencyStore;

    #[test]
    fn accepts_only_uuid_v4() {
        assert!(validate_key("11111111-1111-4111-8111-111111111111").is_ok());
        assert!(validate_key(&Uuid::new_v4().to_string()).is_ok());

        // Well-formed but wrong version (v7).
        let v7 = Uuid::now_v7().to_string();
        assert!(validate_key(&v7).is_err());

        for bad in ["", "not-a-uuid", "11111111-1111-1111-1111-11111111111"] {
            assert!(validate_key(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[tokio::test]
    async fn lookup_replays_what_store_kept() {
        let guard = IdempotencyGuard::new(InMemoryIdempotencyStore::new(), IdempotencyConfig::default());
        let key = Uuid::new_v4();
        let principal = PrincipalId::new();

        assert!(guard.lookup(key, principal).await.unwrap().is_none());

        let body = serde_json::json!({"success": true, "data": {"amount": "20.000"}});
        assert!(guard
            .store(key, principal, "/api/v1/reload", 200, body.clone())
            .await
            .unwrap());

        let replay = guard.lookup(key, principal).await.unwrap().unwrap();
        assert_eq!(replay.code, 200);
        assert_eq!(replay.body, body);

        // Same key, different principal: a distinct slot.
        assert!(guard.lookup(key, PrincipalId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_store_loses_quietly() {
        let guard = IdempotencyGuard::new(InMemoryIdempotencyStore::new(), IdempotencyConfig::default());
        let key = Uuid::new_v4();
        let principal = PrincipalId::new();

        assert!(guard
            .store(key, principal, "/api/v1/reload", 200, serde_json::json!({"first": true}))
            .await
            .unwrap());
        assert!(!guard
            .store(key, principal, "/api/v1/reload", 200, serde_json::json!({"second": true}))
            .await
            .unwrap());

        let replay = guard.lookup(key, principal).await.unwrap().unwrap();
        assert_eq!(replay.body, serde_json::json!({"first": true}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_run_executes_the_operation_once() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let guard = Arc::new(IdempotencyGuard::new(
            InMemoryIdempotencyStore::new(),
            IdempotencyConfig::default(),
        ));
        let key = Uuid::new_v4();
        let principal = PrincipalId::new();
        let executions = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .run(key, principal, "/api/v1/reload", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        (200, serde_json::json!({"success": true}), true)
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut bodies = Vec::new();
        for h in handles {
            bodies.push(h.await.unwrap());
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(bodies.iter().all(|r| *r == bodies[0]), "replies must be identical");
    }

    #[tokio::test]
    async fn transient_outcomes_are_not_cached_by_run() {
        let guard = IdempotencyGuard::new(InMemoryIdempotencyStore::new(), IdempotencyConfig::default());
        let key = Uuid::new_v4();
        let principal = PrincipalId::new();

        let first = guard
            .run(key, principal, "/api/v1/reload", || async {
                (400, serde_json::json!({"error": "INSUFFICIENT_BALANCE"}), false)
            })
            .await
            .unwrap();
        assert_eq!(first.code, 400);

        // The retry runs the operation again and can now succeed.
        let second = guard
            .run(key, principal, "/api/v1/reload", || async {
                (200, serde_json::json!({"success": true}), true)
            })
            .await
            .unwrap();
        assert_eq!(second.code, 200);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn racing_writers_keep_exactly_one_record() {
        let guard = Arc::new(IdempotencyGuard::new(
            InMemoryIdempotencyStore::new(),
            IdempotencyConfig::default(),
        ));
        let key = Uuid::new_v4();
        let principal = PrincipalId::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .store(key, principal, "/api/v1/reload", 200, serde_json::json!({"writer": i}))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
