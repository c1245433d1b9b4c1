use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use lru::LruCache;
use rustc_hash::FxBuildHasher;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tracing::trace;

/// Cache key: question plus the client-subnet prefix when ECS is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: Arc<str>,
    pub rtype: RecordType,
    pub rclass: DNSClass,
    pub ecs: Option<(IpAddr, u8)>,
}

impl CacheKey {
    pub fn new(name: &str, rtype: RecordType, rclass: DNSClass) -> Self {
        Self {
            name: Arc::from(name.to_lowercase().trim_end_matches('.')),
            rtype,
            rclass,
            ecs: None,
        }
    }

    pub fn with_ecs(mut self, ecs: Option<(IpAddr, u8)>) -> Self {
        self.ecs = ecs;
        self
    }
}

struct CacheEntry {
    response: Message,
    stored_at: Instant,
    /// Seconds this entry stays servable; the smallest record TTL after
    /// clamping.
    ttl: u32,
}

/// Size-bounded response cache with TTL clamping on insert.
///
/// Entries expire by remaining TTL; a hit returns the stored message with
/// every record TTL decremented by the entry's age.
pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry, FxBuildHasher>>,
    min_ttl: u32,
    max_ttl: u32,
}

impl ResponseCache {
    /// `size == 0` disables the cache entirely.
    pub fn new(size: usize, min_ttl: u32, max_ttl: u32) -> Option<Self> {
        let capacity = NonZeroUsize::new(size)?;
        Some(Self {
            entries: Mutex::new(LruCache::with_hasher(capacity, FxBuildHasher)),
            min_ttl,
            max_ttl,
        })
    }

    fn clamp(&self, ttl: u32) -> u32 {
        let ttl = ttl.max(self.min_ttl);
        if self.max_ttl > 0 {
            ttl.min(self.max_ttl)
        } else {
            ttl
        }
    }

    /// Cacheable responses: successful answers and NXDOMAIN with authority.
    fn cacheable_ttl(response: &Message) -> Option<u32> {
        if response.truncated() {
            return None;
        }
        match response.response_code() {
            ResponseCode::NoError => {
                let ttl = response.answers().iter().map(|r| r.ttl()).min()?;
                Some(ttl)
            }
            ResponseCode::NXDomain => {
                // Negative caching is bounded by the SOA minimum.
                response
                    .name_servers()
                    .iter()
                    .map(|r| r.ttl())
                    .min()
                    .map(|ttl| ttl.min(600))
            }
            _ => None,
        }
    }

    pub fn insert(&self, key: CacheKey, response: &Message) {
        let Some(ttl) = Self::cacheable_ttl(response) else {
            return;
        };
        let ttl = self.clamp(ttl);
        if ttl == 0 {
            return;
        }
        let entry = CacheEntry {
            response: response.clone(),
            stored_at: Instant::now(),
            ttl,
        };
        self.entries.lock().unwrap().put(key, entry);
    }

    /// Returns the cached response with aged TTLs, or `None` when absent or
    /// expired. Expired entries are evicted in place.
    pub fn get(&self, key: &CacheKey) -> Option<Message> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        let age = entry.stored_at.elapsed().as_secs();
        if age >= entry.ttl as u64 {
            entries.pop(key);
            trace!(name = %key.name, "Cache entry expired");
            return None;
        }
        let mut response = entry.response.clone();
        let age = age as u32;
        let aged = |mut record: hickory_proto::rr::Record| {
            record.set_ttl(record.ttl().saturating_sub(age));
            record
        };
        let answers: Vec<_> = response.take_answers().into_iter().map(aged).collect();
        response.insert_answers(answers);
        let authorities: Vec<_> = response.take_name_servers().into_iter().map(aged).collect();
        response.insert_name_servers(authorities);
        Some(response)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn answer(name: &str, ttl: u32) -> Message {
        let mut message = Message::new(1234, MessageType::Response, OpCode::Query);
        let owner = Name::from_str(name).unwrap();
        message.add_answer(Record::from_rdata(
            owner,
            ttl,
            RData::A(A::from(std::net::Ipv4Addr::new(93, 184, 216, 34))),
        ));
        message
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, RecordType::A, DNSClass::IN)
    }

    #[test]
    fn hit_returns_stored_answer() {
        let cache = ResponseCache::new(16, 0, 0).unwrap();
        cache.insert(key("example.com."), &answer("example.com.", 300));
        let hit = cache.get(&key("example.com.")).unwrap();
        assert_eq!(hit.answers().len(), 1);
        assert!(hit.answers()[0].ttl() <= 300);
    }

    #[test]
    fn key_is_case_insensitive() {
        let cache = ResponseCache::new(16, 0, 0).unwrap();
        cache.insert(key("Example.COM."), &answer("example.com.", 300));
        assert!(cache.get(&key("example.com.")).is_some());
    }

    #[test]
    fn zero_ttl_not_cached() {
        let cache = ResponseCache::new(16, 0, 0).unwrap();
        cache.insert(key("gone.example."), &answer("gone.example.", 0));
        assert!(cache.get(&key("gone.example.")).is_none());
    }

    #[test]
    fn min_ttl_clamp_applies() {
        let cache = ResponseCache::new(16, 60, 0).unwrap();
        cache.insert(key("short.example."), &answer("short.example.", 1));
        // Clamped to 60 s, so still servable.
        assert!(cache.get(&key("short.example.")).is_some());
    }

    #[test]
    fn ecs_prefix_partitions_entries() {
        let cache = ResponseCache::new(16, 0, 0).unwrap();
        let subnet: IpAddr = "203.0.113.0".parse().unwrap();
        cache.insert(
            key("geo.example.").with_ecs(Some((subnet, 24))),
            &answer("geo.example.", 300),
        );
        assert!(cache.get(&key("geo.example.")).is_none());
        assert!(cache
            .get(&key("geo.example.").with_ecs(Some((subnet, 24))))
            .is_some());
    }

    #[test]
    fn disabled_when_size_zero() {
        assert!(ResponseCache::new(0, 0, 0).is_none());
    }

    #[test]
    fn truncated_not_cached() {
        let cache = ResponseCache::new(16, 0, 0).unwrap();
        let mut message = answer("tc.example.", 300);
        message.set_truncated(true);
        cache.insert(key("tc.example."), &message);
        assert!(cache.get(&key("tc.example.")).is_none());
    }
}
