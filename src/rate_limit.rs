//! Per-identity token buckets with a punitive block.
//!
//! Each bucket holds up to `capacity` tokens and regains `refill_amount`
//! tokens per elapsed `refill_interval`. A request that finds the bucket empty
//! blocks the identity for `block_duration`; while blocked every request is
//! rejected no matter how much refill time has passed.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_amount: u32,
    pub refill_interval: Duration,
    pub block_duration: Duration,
}

impl RateLimitConfig {
    /// Tier applied to mutating requests.
    pub fn strict() -> Self {
        Self {
            capacity: 10,
            refill_amount: 10,
            refill_interval: Duration::from_secs(1),
            block_duration: Duration::from_secs(60),
        }
    }

    /// Tier applied to listing and token requests.
    pub fn read() -> Self {
        Self {
            capacity: 60,
            refill_amount: 60,
            refill_interval: Duration::from_secs(1),
            block_duration: Duration::from_secs(5),
        }
    }
}

/// Who a request is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateIdentity {
    User(String),
    Origin(IpAddr),
    /// Neither a session nor a peer address is available.
    Anonymous,
}

impl fmt::Display for RateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Origin(ip) => write!(f, "ip:{ip}"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    refilled_at: Instant,
    blocked_until: Option<Instant>,
}

impl Bucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity,
            refilled_at: now,
            blocked_until: None,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let interval = config.refill_interval.as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.refilled_at).as_nanos();
        let periods = elapsed / interval;
        if periods == 0 {
            return;
        }
        let gained = periods.saturating_mul(u128::from(config.refill_amount));
        let tokens = u128::from(self.tokens).saturating_add(gained);
        self.tokens = tokens.min(u128::from(config.capacity)) as u32;
        // Keep the partial period so refill stays aligned to the interval.
        let consumed = u32::try_from(periods).unwrap_or(u32::MAX);
        self.refilled_at += config.refill_interval.saturating_mul(consumed);
    }

    fn idle_since(&self, config: &RateLimitConfig) -> Option<Instant> {
        match self.blocked_until {
            Some(_) => None,
            None => Some(self.refilled_at + config.refill_interval),
        }
    }
}

pub struct RateLimiter {
    name: &'static str,
    config: RateLimitConfig,
    buckets: Mutex<HashMap<RateIdentity, Bucket>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `identity`. The whole check-and-update runs under
    /// one lock, so concurrent callers can never spend the same token.
    pub async fn consume(&self, identity: &RateIdentity) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(identity.clone())
            .or_insert_with(|| Bucket::full(self.config.capacity, now));

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return RateDecision::Limited { retry_after: until - now };
            }
            *bucket = Bucket::full(self.config.capacity, now);
        }

        bucket.refill(&self.config, now);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return RateDecision::Allowed { remaining: bucket.tokens };
        }

        bucket.blocked_until = Some(now + self.config.block_duration);
        warn!(
            limiter = self.name,
            %identity,
            block_secs = self.config.block_duration.as_secs(),
            "Rate limit exhausted, blocking identity"
        );
        RateDecision::Limited { retry_after: self.config.block_duration }
    }

    /// Drop buckets that are unblocked and have been idle for at least `idle`.
    pub async fn prune(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| match bucket.blocked_until {
            Some(until) => now < until,
            None => bucket
                .idle_since(&self.config)
                .map_or(true, |since| now.saturating_duration_since(since) < idle),
        });
        before - buckets.len()
    }

    pub async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }
}
