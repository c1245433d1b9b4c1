use dashmap::DashMap;
use homegate_domain::ClientMatcher;
use rustc_hash::FxBuildHasher;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Buckets idle for this long are dropped by `sweep`.
const IDLE_EXPIRY: Duration = Duration::from_secs(3600);

/// Every started 1000 bytes of a response consumes one token.
const BYTES_PER_TOKEN: usize = 1000;

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Per-client token buckets at `qps` queries per second.
///
/// Buckets live in a TTL map: `sweep` removes entries idle for an hour.
/// Whitelisted clients bypass the limiter entirely; `qps == 0` disables it.
pub struct RateLimiter {
    qps: u32,
    whitelist: ClientMatcher,
    buckets: DashMap<IpAddr, Bucket, FxBuildHasher>,
}

impl RateLimiter {
    pub fn new(qps: u32, whitelist: ClientMatcher) -> Self {
        Self {
            qps,
            whitelist,
            buckets: DashMap::with_hasher(FxBuildHasher),
        }
    }

    pub fn enabled(&self) -> bool {
        self.qps > 0
    }

    fn take(&self, ip: IpAddr, cost: f64) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.qps as f64,
            refilled_at: now,
        });
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps as f64).min(self.qps as f64);
        bucket.refilled_at = now;
        if bucket.tokens < cost {
            return false;
        }
        bucket.tokens -= cost;
        true
    }

    /// Admit one query from `ip`. Over-limit queries are dropped by the
    /// caller with no response.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if !self.enabled() || self.whitelist.contains(ip) {
            return true;
        }
        let admitted = self.take(ip, 1.0);
        if !admitted {
            debug!(client = %ip, "Rate limit exceeded, dropping query");
        }
        admitted
    }

    /// Charge the extra tokens a large UDP response costs beyond the one
    /// taken at admission. The balance may go negative, delaying refill.
    pub fn charge_response(&self, ip: IpAddr, response_len: usize) {
        if !self.enabled() || self.whitelist.contains(ip) {
            return;
        }
        let total = response_len.div_ceil(BYTES_PER_TOKEN).max(1);
        let extra = (total - 1) as f64;
        if extra > 0.0 {
            if let Some(mut bucket) = self.buckets.get_mut(&ip) {
                bucket.tokens -= extra;
            }
        }
    }

    /// Drop buckets idle past the TTL. Invoked from the server's
    /// housekeeping tick.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.refilled_at) < IDLE_EXPIRY);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn burst_up_to_qps_then_drop() {
        let limiter = RateLimiter::new(5, ClientMatcher::default());
        let client = ip("192.168.1.2");
        for _ in 0..5 {
            assert!(limiter.allow(client));
        }
        assert!(!limiter.allow(client));
    }

    #[test]
    fn distinct_clients_have_distinct_buckets() {
        let limiter = RateLimiter::new(1, ClientMatcher::default());
        assert!(limiter.allow(ip("10.0.0.1")));
        assert!(limiter.allow(ip("10.0.0.2")));
        assert!(!limiter.allow(ip("10.0.0.1")));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn whitelist_bypasses() {
        let whitelist = ClientMatcher::compile(&["10.0.0.0/8".to_string()]).unwrap();
        let limiter = RateLimiter::new(1, whitelist);
        for _ in 0..100 {
            assert!(limiter.allow(ip("10.1.1.1")));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn zero_qps_disables() {
        let limiter = RateLimiter::new(0, ClientMatcher::default());
        for _ in 0..1000 {
            assert!(limiter.allow(ip("172.16.0.9")));
        }
    }

    #[test]
    fn large_response_costs_extra_tokens() {
        let limiter = RateLimiter::new(5, ClientMatcher::default());
        let client = ip("192.0.2.1");
        assert!(limiter.allow(client));
        // 4100 bytes => 5 tokens total, 4 beyond the admission token.
        limiter.charge_response(client, 4100);
        assert!(!limiter.allow(client));
    }
}
