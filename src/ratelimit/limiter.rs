//! Core rate limiter implementation.
//!
//! Fixed-window counting per client against a shared [`WindowStore`]:
//!
//! 1. Read the client's count.
//! 2. No count: open a window with count 1 that expires after
//!    `window_secs`, and admit.
//! 3. Count below `max_requests`: increment and admit.
//! 4. Otherwise: reject with the window's remaining TTL as retry hint.
//!
//! The read and the write are separate store calls. Concurrent requests for
//! the same client can both see no window and both open one, or both see
//! room and both increment, so a window may admit a few more than
//! `max_requests` under contention. Windows start at a client's first
//! request rather than on clock boundaries, so a burst straddling two
//! windows can admit up to twice the limit.
//!
//! Any store failure admits the request.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::client_key::ClientKey;
use super::store::{StoreError, WindowStore};

/// Window length used when none is configured.
const DEFAULT_WINDOW_SECS: u64 = 60;
/// Admission threshold used when none is configured.
const DEFAULT_MAX_REQUESTS: u64 = 10;

/// The limit enforced for every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    window_secs: u64,
    max_requests: u64,
}

impl WindowPolicy {
    /// Create a policy.
    ///
    /// Callers validate the values first; zero is clamped to one so a policy
    /// can always open a window and admit its first request.
    pub fn new(window_secs: u64, max_requests: u64) -> Self {
        Self {
            window_secs: window_secs.max(1),
            max_requests: max_requests.max(1),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SECS, DEFAULT_MAX_REQUESTS)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Let the request through
    Admit,
    /// Refuse the request; the window reopens after `retry_after_secs`
    Reject { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// The rate limiter shared by all request handlers.
///
/// Holds no mutable state of its own; cloning is cheap and every clone
/// talks to the same store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    policy: WindowPolicy,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter over the given store.
    pub fn new(store: Arc<dyn WindowStore>, policy: WindowPolicy) -> Self {
        Self { store, policy }
    }

    /// Get the enforced policy.
    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Decide whether the request identified by `key` may proceed.
    ///
    /// Never fails: if the store cannot be used the request is admitted.
    pub async fn decide(&self, key: &ClientKey) -> Decision {
        match self.try_decide(key).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Counter store failed, admitting request"
                );
                Decision::Admit
            }
        }
    }

    /// Run the fixed-window check, surfacing store failures.
    pub async fn try_decide(&self, key: &ClientKey) -> Result<Decision, StoreError> {
        let key_str = key.as_str();

        trace!(key = %key, "Checking rate limit");

        let Some(count) = self.store.get(key_str).await? else {
            debug!(
                key = %key,
                window_secs = self.policy.window_secs,
                "Opening rate limit window"
            );
            self.store
                .set_with_expiry(key_str, 1, self.policy.window_secs)
                .await?;
            return Ok(Decision::Admit);
        };

        if count < self.policy.max_requests {
            self.store.increment(key_str).await?;
            return Ok(Decision::Admit);
        }

        let retry_after_secs = self.store.ttl(key_str).await?;
        debug!(
            key = %key,
            count = count,
            limit = self.policy.max_requests,
            retry_after_secs = retry_after_secs,
            "Rate limit exceeded"
        );
        Ok(Decision::Reject { retry_after_secs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, Duration};

    /// A store whose every call fails.
    struct UnavailableStore;

    #[async_trait]
    impl WindowStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn set_with_expiry(&self, _: &str, _: u64, _: u64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn increment(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ttl(&self, _key: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// Reads from a real store, fails one chosen operation.
    struct FailingOn {
        inner: InMemoryStore,
        op: &'static str,
    }

    #[async_trait]
    impl WindowStore for FailingOn {
        async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
            if self.op == "get" {
                return Err(StoreError::Timeout(Duration::from_millis(500)));
            }
            self.inner.get(key).await
        }

        async fn set_with_expiry(&self, key: &str, v: u64, ttl: u64) -> Result<(), StoreError> {
            if self.op == "set" {
                return Err(StoreError::Timeout(Duration::from_millis(500)));
            }
            self.inner.set_with_expiry(key, v, ttl).await
        }

        async fn increment(&self, key: &str) -> Result<(), StoreError> {
            if self.op == "incr" {
                return Err(StoreError::Timeout(Duration::from_millis(500)));
            }
            self.inner.increment(key).await
        }

        async fn ttl(&self, key: &str) -> Result<u64, StoreError> {
            if self.op == "ttl" {
                return Err(StoreError::Protocol("bad reply".to_string()));
            }
            self.inner.ttl(key).await
        }
    }

    /// Always reports no window, as two racing requests would both observe.
    #[derive(Default)]
    struct NeverSeesWindow {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl WindowStore for NeverSeesWindow {
        async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            Ok(None)
        }

        async fn set_with_expiry(&self, _: &str, _: u64, _: u64) -> Result<(), StoreError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn increment(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn ttl(&self, _key: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn memory_limiter(window_secs: u64, max_requests: u64) -> (RateLimiter, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), WindowPolicy::new(window_secs, max_requests));
        (limiter, store)
    }

    fn key(ip: &str) -> ClientKey {
        ClientKey::new("rate_limit:", ip)
    }

    #[test]
    fn test_policy_defaults_and_clamping() {
        let policy = WindowPolicy::default();
        assert_eq!(policy.window_secs(), 60);
        assert_eq!(policy.max_requests(), 10);

        let clamped = WindowPolicy::new(0, 0);
        assert_eq!(clamped.window_secs(), 1);
        assert_eq!(clamped.max_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_opens_window() {
        let (limiter, store) = memory_limiter(60, 10);
        let k = key("192.0.2.1");

        assert_eq!(limiter.decide(&k).await, Decision::Admit);
        assert_eq!(store.get(k.as_str()).await.unwrap(), Some(1));
        assert_eq!(store.ttl(k.as_str()).await.unwrap(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_then_rejects() {
        let (limiter, store) = memory_limiter(60, 10);
        let k = key("K");

        for i in 1..=10 {
            assert_eq!(limiter.decide(&k).await, Decision::Admit, "request {} should be admitted", i);
        }
        assert_eq!(store.get(k.as_str()).await.unwrap(), Some(10));

        for _ in 0..5 {
            let decision = limiter.decide(&k).await;
            assert!(matches!(decision, Decision::Reject { .. }));
        }
        // Rejections do not count
        assert_eq!(store.get(k.as_str()).await.unwrap(), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_carries_remaining_ttl() {
        let (limiter, store) = memory_limiter(60, 2);
        let k = key("192.0.2.2");

        limiter.decide(&k).await;
        limiter.decide(&k).await;
        advance(Duration::from_secs(15)).await;

        let decision = limiter.decide(&k).await;
        let expected = store.ttl(k.as_str()).await.unwrap();
        assert_eq!(expected, 45);
        assert_eq!(decision, Decision::Reject { retry_after_secs: expected });
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_of_sixty_seconds_and_ten_requests() {
        let (limiter, _store) = memory_limiter(60, 10);
        let k = key("K");

        for _ in 1..=10 {
            assert!(limiter.decide(&k).await.is_admit());
        }

        match limiter.decide(&k).await {
            Decision::Reject { retry_after_secs } => {
                assert!(retry_after_secs > 0);
                assert!(retry_after_secs <= 60);
            }
            Decision::Admit => panic!("11th request should be rejected"),
        }

        advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.decide(&k).await, Decision::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_window_restarts_from_scratch() {
        let (limiter, store) = memory_limiter(10, 3);
        let k = key("192.0.2.3");

        for _ in 0..4 {
            limiter.decide(&k).await;
        }
        advance(Duration::from_secs(10)).await;

        assert_eq!(limiter.decide(&k).await, Decision::Admit);
        assert_eq!(store.get(k.as_str()).await.unwrap(), Some(1));
        assert_eq!(store.ttl(k.as_str()).await.unwrap(), 10);

        // A fresh window grants the full allowance again
        assert!(limiter.decide(&k).await.is_admit());
        assert!(limiter.decide(&k).await.is_admit());
        assert!(!limiter.decide(&k).await.is_admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_does_not_slide() {
        let (limiter, _store) = memory_limiter(10, 2);
        let k = key("192.0.2.4");

        limiter.decide(&k).await;
        advance(Duration::from_secs(9)).await;
        limiter.decide(&k).await;
        assert!(!limiter.decide(&k).await.is_admit());

        // The window opened by the first request closes 10s after it,
        // regardless of the later request.
        advance(Duration::from_secs(1)).await;
        assert!(limiter.decide(&k).await.is_admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_burst_admits_twice_the_limit() {
        let (limiter, _store) = memory_limiter(10, 3);
        let k = key("192.0.2.5");

        limiter.decide(&k).await;
        advance(Duration::from_millis(9_900)).await;
        let mut admitted = 0;
        for _ in 0..2 {
            admitted += limiter.decide(&k).await.is_admit() as u32;
        }
        advance(Duration::from_millis(100)).await;
        for _ in 0..3 {
            admitted += limiter.decide(&k).await.is_admit() as u32;
        }
        // 2 late in the first window, 3 early in the next, 0.1s apart
        assert_eq!(admitted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_are_independent() {
        let (limiter, _store) = memory_limiter(60, 10);
        let a = key("A");
        let b = key("B");

        for _ in 0..10 {
            assert!(limiter.decide(&a).await.is_admit());
            assert!(limiter.decide(&b).await.is_admit());
        }

        assert!(!limiter.decide(&a).await.is_admit());
        assert!(!limiter.decide(&b).await.is_admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausting_one_key_leaves_others_alone() {
        let (limiter, _store) = memory_limiter(60, 1);

        assert!(limiter.decide(&key("A")).await.is_admit());
        assert!(!limiter.decide(&key("A")).await.is_admit());
        assert!(limiter.decide(&key("B")).await.is_admit());
    }

    #[tokio::test]
    async fn test_unavailable_store_admits_everything() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), WindowPolicy::new(60, 1));

        for ip in ["A", "B", "C"] {
            for _ in 0..20 {
                assert_eq!(limiter.decide(&key(ip)).await, Decision::Admit);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_window_fails_open() {
        let (limiter, store) = memory_limiter(u64::MAX, 10);
        let k = key("192.0.2.9");

        assert!(matches!(
            limiter.try_decide(&k).await,
            Err(StoreError::Protocol(_))
        ));
        assert_eq!(limiter.decide(&k).await, Decision::Admit);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_try_decide_surfaces_store_errors() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), WindowPolicy::default());
        let result = limiter.try_decide(&key("A")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_failing_operation_fails_open() {
        // (failing operation, key whose path reaches it)
        let cases = [("get", "A"), ("set", "C"), ("incr", "B"), ("ttl", "A")];

        for (op, ip) in cases {
            let store = FailingOn {
                inner: InMemoryStore::new(),
                op,
            };
            // A is exhausted, B has room, C has no window
            store.inner.set_with_expiry("rate_limit:A", 5, 60).await.unwrap();
            store.inner.set_with_expiry("rate_limit:B", 1, 60).await.unwrap();
            let limiter = RateLimiter::new(Arc::new(store), WindowPolicy::new(60, 5));

            assert!(limiter.try_decide(&key(ip)).await.is_err(), "{} should fail", op);
            assert_eq!(limiter.decide(&key(ip)).await, Decision::Admit, "{} failing", op);
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_all_open_windows() {
        // Requests racing on an empty key each see no window and each
        // re-open it; all of them are admitted.
        let store = Arc::new(NeverSeesWindow::default());
        let limiter = RateLimiter::new(store.clone(), WindowPolicy::new(60, 1));
        let k = key("192.0.2.9");

        let decisions = futures::future::join_all((0..5).map(|_| limiter.decide(&k))).await;

        assert!(decisions.iter().all(Decision::is_admit));
        assert_eq!(store.opened.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_tasks_share_one_counter() {
        let (limiter, store) = memory_limiter(60, 100);
        let k = key("192.0.2.10");

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                let k = k.clone();
                tokio::spawn(async move { limiter.decide(&k).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_admit());
        }
        assert_eq!(store.get(k.as_str()).await.unwrap(), Some(20));
    }
}
