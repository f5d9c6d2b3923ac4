//! Admission and traffic-shaping policies.
//!
//! # Responsibilities
//! - Reject over-budget traffic immediately (token bucket, in-flight cap)
//! - Inject latency for fault-injection experiments
//! - Mirror sampled traffic to a shadow destination
//! - Balance across children on live latency feedback
//!
//! # Design Decisions
//! - Rejection is a backpressure signal, not buffering: nothing queues
//! - All shared state is per-node and atomic or behind a small mutex;
//!   nothing locks across the tree

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

use crate::config::value::{self as cfg, ConfigPath};
use crate::error::{ConfigError, RequestError};
use crate::message::{Reply, Request};
use crate::observability::metrics;
use crate::routing::{RouteFactory, RouteHandle, RouteNode};

/// A simple token bucket.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-node token-bucket rate limit. Over-budget requests fail with
/// `Throttled` immediately; they are never queued.
pub struct RateLimitRoute {
    children: Vec<RouteHandle>,
    bucket: Mutex<TokenBucket>,
    refill_rate: f64,
    burst: f64,
}

impl RateLimitRoute {
    pub fn new(child: RouteHandle, requests_per_second: f64, burst: f64) -> Self {
        Self {
            children: vec![child],
            bucket: Mutex::new(TokenBucket::new(burst)),
            refill_rate: requests_per_second,
            burst,
        }
    }
}

#[async_trait]
impl RouteNode for RateLimitRoute {
    fn kind(&self) -> &'static str {
        "rate-limit"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let admitted = {
            let mut bucket = self.bucket.lock().expect("rate limiter mutex poisoned");
            bucket.try_acquire(self.burst, self.refill_rate)
        };
        if !admitted {
            metrics::record_throttled("rate");
            tracing::debug!(key = %req.key, "Rate limit exceeded");
            return Err(RequestError::Throttled("rate"));
        }
        self.children[0].route(req).await
    }
}

pub(crate) fn build_rate_limit(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "rate-limit", path)?;
    let child = factory.build_child_field(obj, "child", "rate-limit", path)?;
    let rps = cfg::f64_or(obj, "requests_per_second", 0.0, "rate-limit", path)?;
    if rps <= 0.0 {
        return Err(ConfigError::new(
            "rate-limit",
            path,
            "`requests_per_second` must be a positive number",
        ));
    }
    let burst = cfg::f64_or(obj, "burst", rps, "rate-limit", path)?;
    Ok(Arc::new(RateLimitRoute::new(child, rps, burst)))
}

/// Caps concurrent in-flight requests through the node.
pub struct OutstandingLimitRoute {
    children: Vec<RouteHandle>,
    in_flight: Arc<AtomicUsize>,
    limit: usize,
}

impl OutstandingLimitRoute {
    pub fn new(child: RouteHandle, limit: usize) -> Self {
        Self {
            children: vec![child],
            in_flight: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// CAS loop so the count can never overshoot the limit under races.
    fn try_acquire(&self) -> Option<InFlightGuard> {
        let mut prev = self.in_flight.load(Ordering::Relaxed);
        loop {
            if prev >= self.limit {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(InFlightGuard {
            counter: self.in_flight.clone(),
        })
    }
}

/// RAII guard that releases one in-flight slot on drop.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl RouteNode for OutstandingLimitRoute {
    fn kind(&self) -> &'static str {
        "outstanding-limit"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let _guard = match self.try_acquire() {
            Some(guard) => guard,
            None => {
                metrics::record_throttled("outstanding");
                return Err(RequestError::Throttled("outstanding"));
            }
        };
        self.children[0].route(req).await
    }
}

pub(crate) fn build_outstanding_limit(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "outstanding-limit", path)?;
    let child = factory.build_child_field(obj, "child", "outstanding-limit", path)?;
    let limit = cfg::opt_u64(obj, "max_outstanding", "outstanding-limit", path)?.ok_or_else(
        || {
            ConfigError::new(
                "outstanding-limit",
                path,
                "missing required field `max_outstanding`",
            )
        },
    )?;
    if limit == 0 {
        return Err(ConfigError::new(
            "outstanding-limit",
            path.child("max_outstanding"),
            "must be at least 1",
        ));
    }
    Ok(Arc::new(OutstandingLimitRoute::new(child, limit as usize)))
}

/// Injects fixed and random delay around the child dispatch. Fault
/// injection only; no correctness effect.
pub struct LatencyInjectionRoute {
    children: Vec<RouteHandle>,
    before: Duration,
    after: Duration,
    jitter_ms: u64,
}

impl LatencyInjectionRoute {
    pub fn new(child: RouteHandle, before: Duration, after: Duration, jitter_ms: u64) -> Self {
        Self {
            children: vec![child],
            before,
            after,
            jitter_ms,
        }
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..self.jitter_ms))
    }
}

#[async_trait]
impl RouteNode for LatencyInjectionRoute {
    fn kind(&self) -> &'static str {
        "latency-injection"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let before = self.before + self.jitter();
        if !before.is_zero() {
            tokio::time::sleep(before).await;
        }
        let result = self.children[0].route(req).await;
        if !self.after.is_zero() {
            tokio::time::sleep(self.after).await;
        }
        result
    }
}

pub(crate) fn build_latency_injection(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "latency-injection", path)?;
    let child = factory.build_child_field(obj, "child", "latency-injection", path)?;
    let before = cfg::u64_or(obj, "before_ms", 0, "latency-injection", path)?;
    let after = cfg::u64_or(obj, "after_ms", 0, "latency-injection", path)?;
    let jitter = cfg::u64_or(obj, "jitter_ms", 0, "latency-injection", path)?;
    Ok(Arc::new(LatencyInjectionRoute::new(
        child,
        Duration::from_millis(before),
        Duration::from_millis(after),
        jitter,
    )))
}

/// Mirrors a sampled copy of traffic to a shadow child whose reply and
/// failures never affect the primary result.
pub struct ShadowRoute {
    children: Vec<RouteHandle>,
    sample_rate: f64,
    key_prefix: Option<String>,
}

impl ShadowRoute {
    /// Children are `[primary, shadow]`.
    pub fn new(
        primary: RouteHandle,
        shadow: RouteHandle,
        sample_rate: f64,
        key_prefix: Option<String>,
    ) -> Self {
        Self {
            children: vec![primary, shadow],
            sample_rate,
            key_prefix,
        }
    }

    fn sampled(&self) -> bool {
        self.sample_rate >= 1.0 || fastrand::f64() < self.sample_rate
    }
}

#[async_trait]
impl RouteNode for ShadowRoute {
    fn kind(&self) -> &'static str {
        "shadow"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        if self.sampled() {
            let copy = match &self.key_prefix {
                Some(prefix) => req.with_key(format!("{prefix}{}", req.key)),
                None => req.clone(),
            };
            super::fanout::spawn_discarded(Arc::clone(&self.children[1]), copy, "shadow");
        }
        self.children[0].route(req).await
    }
}

pub(crate) fn build_shadow(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "shadow", path)?;
    let primary = factory.build_child_field(obj, "child", "shadow", path)?;
    let shadow = factory.build_child_field(obj, "shadow", "shadow", path)?;
    let sample_rate = cfg::f64_or(obj, "sample_rate", 1.0, "shadow", path)?;
    if !(0.0..=1.0).contains(&sample_rate) {
        return Err(ConfigError::new(
            "shadow",
            path.child("sample_rate"),
            "must be between 0.0 and 1.0",
        ));
    }
    let key_prefix = cfg::opt_str(obj, "key_prefix", "shadow", path)?.map(String::from);
    Ok(Arc::new(ShadowRoute::new(
        primary,
        shadow,
        sample_rate,
        key_prefix,
    )))
}

/// Per-child latency feedback. `updated_ms` is milliseconds since the
/// node's epoch plus one; zero means no sample yet.
struct ChildFeedback {
    score_us: AtomicU64,
    updated_ms: AtomicU64,
}

/// Two-random-choices balancing on EWMA latency. Stale or absent feedback
/// degrades a child to the neutral default score instead of failing.
pub struct LoadBalancerRoute {
    children: Vec<RouteHandle>,
    feedback: Vec<ChildFeedback>,
    feedback_ttl: Duration,
    default_score_us: u64,
    epoch: Instant,
}

impl LoadBalancerRoute {
    pub fn new(
        children: Vec<RouteHandle>,
        feedback_ttl: Duration,
        default_score_us: u64,
    ) -> Self {
        let feedback = children
            .iter()
            .map(|_| ChildFeedback {
                score_us: AtomicU64::new(0),
                updated_ms: AtomicU64::new(0),
            })
            .collect();
        Self {
            children,
            feedback,
            feedback_ttl,
            default_score_us,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn effective_score(&self, index: usize, now_ms: u64) -> u64 {
        let updated = self.feedback[index].updated_ms.load(Ordering::Relaxed);
        if updated == 0 || now_ms.saturating_sub(updated) > self.feedback_ttl.as_millis() as u64 {
            return self.default_score_us;
        }
        self.feedback[index].score_us.load(Ordering::Relaxed)
    }

    fn pick(&self) -> usize {
        let n = self.children.len();
        if n == 1 {
            return 0;
        }
        let a = fastrand::usize(..n);
        let mut b = fastrand::usize(..n - 1);
        if b >= a {
            b += 1;
        }
        let now_ms = self.now_ms();
        if self.effective_score(a, now_ms) <= self.effective_score(b, now_ms) {
            a
        } else {
            b
        }
    }

    fn record(&self, index: usize, sample_us: u64) {
        let slot = &self.feedback[index];
        let old = slot.score_us.load(Ordering::Relaxed);
        let updated = slot.updated_ms.load(Ordering::Relaxed);
        let new = if updated == 0 {
            sample_us
        } else {
            // EWMA, 1/8 sample weight
            (old * 7 + sample_us) / 8
        };
        slot.score_us.store(new, Ordering::Relaxed);
        slot.updated_ms.store(self.now_ms(), Ordering::Relaxed);
    }
}

#[async_trait]
impl RouteNode for LoadBalancerRoute {
    fn kind(&self) -> &'static str {
        "load-balancer"
    }

    fn children(&self) -> &[RouteHandle] {
        &self.children
    }

    async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
        let index = self.pick();
        let start = Instant::now();
        let result = self.children[index].route(req).await;
        let sample_us = match &result {
            Ok(_) => start.elapsed().as_micros() as u64,
            // A failure is scored as several defaults worth of latency so
            // the balancer drifts away from the failing child.
            Err(_) => self.default_score_us.saturating_mul(4),
        };
        self.record(index, sample_us);
        result
    }
}

pub(crate) fn build_load_balancer(
    factory: &RouteFactory<'_>,
    config: &Value,
    path: &ConfigPath,
) -> Result<RouteHandle, ConfigError> {
    let obj = cfg::as_object(config, "load-balancer", path)?;
    let children = factory.build_children_field(obj, "children", "load-balancer", path)?;
    let feedback_ttl = cfg::u64_or(obj, "feedback_ttl_ms", 10_000, "load-balancer", path)?;
    let default_score_us =
        cfg::u64_or(obj, "default_score_us", 1_000, "load-balancer", path)?;
    Ok(Arc::new(LoadBalancerRoute::new(
        children,
        Duration::from_millis(feedback_ttl),
        default_score_us,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResultCode;
    use crate::routing::leaf::NullRoute;
    use std::sync::atomic::AtomicUsize;

    fn null() -> RouteHandle {
        Arc::new(NullRoute)
    }

    struct Slow(Duration);

    #[async_trait]
    impl RouteNode for Slow {
        fn kind(&self) -> &'static str {
            "slow"
        }

        async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
            tokio::time::sleep(self.0).await;
            Ok(Reply::default_for(req.op))
        }
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_over_budget_immediately() {
        let node = RateLimitRoute::new(null(), 1.0, 1.0);

        assert!(node.route(&Request::get("k")).await.is_ok());

        let start = Instant::now();
        let err = node.route(&Request::get("k")).await.unwrap_err();
        assert_eq!(err, RequestError::Throttled("rate"));
        // Rejected, not delayed.
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_rate_limit_refills() {
        let node = RateLimitRoute::new(null(), 50.0, 1.0);
        assert!(node.route(&Request::get("k")).await.is_ok());
        assert!(node.route(&Request::get("k")).await.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(node.route(&Request::get("k")).await.is_ok());
    }

    #[tokio::test]
    async fn test_outstanding_limit_rejects_excess() {
        let node = Arc::new(OutstandingLimitRoute::new(
            Arc::new(Slow(Duration::from_millis(200))),
            2,
        ));

        let t1 = tokio::spawn({
            let node = node.clone();
            async move { node.route(&Request::get("a")).await }
        });
        let t2 = tokio::spawn({
            let node = node.clone();
            async move { node.route(&Request::get("b")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = node.route(&Request::get("c")).await.unwrap_err();
        assert_eq!(err, RequestError::Throttled("outstanding"));

        assert!(t1.await.unwrap().is_ok());
        assert!(t2.await.unwrap().is_ok());

        // Slots released; the node admits again.
        assert!(node.route(&Request::get("d")).await.is_ok());
    }

    #[tokio::test]
    async fn test_latency_injection_delays_reply() {
        let node = LatencyInjectionRoute::new(
            null(),
            Duration::from_millis(50),
            Duration::from_millis(0),
            0,
        );
        let start = Instant::now();
        node.route(&Request::get("k")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_shadow_failure_never_affects_primary() {
        struct Failing;

        #[async_trait]
        impl RouteNode for Failing {
            fn kind(&self) -> &'static str {
                "failing"
            }

            async fn route(&self, _req: &Request) -> Result<Reply, RequestError> {
                Err(RequestError::Unavailable {
                    destination: "shadow[0]".into(),
                    reason: "down".into(),
                })
            }
        }

        let node = ShadowRoute::new(null(), Arc::new(Failing), 1.0, None);
        let reply = node.route(&Request::get("k")).await.unwrap();
        assert_eq!(reply.result, ResultCode::NotFound);
    }

    #[tokio::test]
    async fn test_shadow_rewrites_mirrored_key() {
        struct KeyCapture(Mutex<Vec<String>>);

        #[async_trait]
        impl RouteNode for KeyCapture {
            fn kind(&self) -> &'static str {
                "capture"
            }

            async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
                self.0.lock().unwrap().push(req.key.clone());
                Ok(Reply::default_for(req.op))
            }
        }

        let capture = Arc::new(KeyCapture(Mutex::new(Vec::new())));
        let node = ShadowRoute::new(null(), capture.clone(), 1.0, Some("shadow:".into()));

        node.route(&Request::get("user:1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(capture.0.lock().unwrap().as_slice(), ["shadow:user:1"]);
    }

    #[tokio::test]
    async fn test_load_balancer_avoids_slow_child() {
        struct Counting {
            delay: Duration,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl RouteNode for Counting {
            fn kind(&self) -> &'static str {
                "counting"
            }

            async fn route(&self, req: &Request) -> Result<Reply, RequestError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                Ok(Reply::default_for(req.op))
            }
        }

        let fast = Arc::new(Counting {
            delay: Duration::from_millis(1),
            calls: AtomicUsize::new(0),
        });
        let slow = Arc::new(Counting {
            delay: Duration::from_millis(40),
            calls: AtomicUsize::new(0),
        });
        let node = LoadBalancerRoute::new(
            vec![fast.clone(), slow.clone()],
            Duration::from_secs(10),
            1_000,
        );

        for i in 0..40 {
            node.route(&Request::get(format!("k{i}"))).await.unwrap();
        }
        // Two-choice with feedback strongly prefers the fast child once
        // both have samples.
        assert!(fast.calls.load(Ordering::SeqCst) > slow.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_load_balancer_single_child_degenerates() {
        let node = LoadBalancerRoute::new(vec![null()], Duration::from_secs(1), 1_000);
        assert!(node.route(&Request::get("k")).await.is_ok());
    }
}
