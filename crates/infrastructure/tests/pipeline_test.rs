mod helpers;

use helpers::mock_upstream::MockUpstream;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use homegate_domain::config::dns::RewriteRule;
use homegate_domain::{AccessList, BlockingMode, ClientMatcher, DnsConfig, UpstreamPolicy};
use homegate_infrastructure::dns::access::AccessEngine;
use homegate_infrastructure::dns::cache::ResponseCache;
use homegate_infrastructure::dns::filter::FilterEngine;
use homegate_infrastructure::dns::pipeline::{Pipeline, PipelineSettings};
use homegate_infrastructure::dns::ratelimit::RateLimiter;
use homegate_infrastructure::dns::upstream::bootstrap::Bootstrapper;
use homegate_infrastructure::dns::upstream::pool::UpstreamPool;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const CLIENT: &str = "192.168.1.50:51234";

fn query(name: &str, rtype: RecordType) -> Message {
    let mut q = Query::new();
    q.set_name(Name::from_str(&format!("{}.", name.trim_end_matches('.'))).unwrap());
    q.set_query_type(rtype);
    let mut message = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(q);
    message
}

fn client() -> SocketAddr {
    CLIENT.parse().unwrap()
}

struct TestBench {
    pipeline: Pipeline,
}

impl TestBench {
    fn build(mut config: DnsConfig, upstream_addr: &str, lists: &[(i64, Vec<String>)]) -> Self {
        config.upstream_dns = vec![upstream_addr.to_string()];

        let access = Arc::new(
            AccessEngine::new(AccessList {
                allowed_clients: config.allowed_clients.clone(),
                disallowed_clients: config.disallowed_clients.clone(),
                blocked_hosts: config.blocked_hosts.clone(),
            })
            .unwrap(),
        );
        let ratelimit = Arc::new(RateLimiter::new(
            config.ratelimit,
            ClientMatcher::compile(&config.ratelimit_whitelist).unwrap(),
        ));
        let filter = Arc::new(FilterEngine::new(&config, lists));
        let cache = ResponseCache::new(config.cache_size, config.cache_min_ttl, config.cache_max_ttl)
            .map(Arc::new);
        let bootstrap = Arc::new(Bootstrapper::new(&config.bootstrap_dns).unwrap());
        let pool = Arc::new(
            UpstreamPool::new(
                &config.upstream_dns,
                UpstreamPolicy::LoadBalance,
                bootstrap,
                Duration::from_millis(config.upstream_timeout_ms),
                config.bogus_nxdomain.clone(),
            )
            .unwrap(),
        );

        let pipeline = Pipeline::new(
            PipelineSettings::from_config(&config),
            access,
            ratelimit,
            filter,
            cache,
            pool,
            None,
            None,
        );
        Self { pipeline }
    }
}

#[tokio::test]
async fn upstream_answer_passes_through() {
    let upstream = MockUpstream::start(&[(
        "google-public-dns-a.google.com",
        "8.8.8.8".parse().unwrap(),
    )])
    .await;
    let bench = TestBench::build(DnsConfig::default(), &upstream.addr, &[]);

    let request = query("google-public-dns-a.google.com", RecordType::A);
    let id = request.id();
    let response = bench.pipeline.handle(request, client()).await.unwrap();

    assert_eq!(response.id(), id);
    assert_eq!(response.answers().len(), 1);
    let a = response.answers()[0].data().as_a().unwrap();
    assert_eq!(a.0, Ipv4Addr::new(8, 8, 8, 8));
    assert!(response.answers()[0].ttl() > 0);
}

#[tokio::test]
async fn disallowed_client_gets_no_response() {
    let upstream = MockUpstream::start(&[]).await;
    let mut config = DnsConfig::default();
    config.disallowed_clients = vec!["192.168.1.50".to_string()];
    let bench = TestBench::build(config, &upstream.addr, &[]);

    let response = bench
        .pipeline
        .handle(query("example.com", RecordType::A), client())
        .await;
    assert!(response.is_none());
    assert_eq!(upstream.query_count(), 0);
}

#[tokio::test]
async fn allowlist_excludes_everyone_else() {
    let upstream = MockUpstream::start(&[]).await;
    let mut config = DnsConfig::default();
    config.allowed_clients = vec!["10.0.0.0/8".to_string()];
    let bench = TestBench::build(config, &upstream.addr, &[]);

    let response = bench
        .pipeline
        .handle(query("example.com", RecordType::A), client())
        .await;
    assert!(response.is_none());
}

#[tokio::test]
async fn blocklist_rule_answers_nxdomain() {
    let upstream = MockUpstream::start(&[]).await;
    let mut config = DnsConfig::default();
    config.blocking_mode = BlockingMode::NxDomain;
    let lists = vec![(1, vec!["||nxdomain.example.org^".to_string()])];
    let bench = TestBench::build(config, &upstream.addr, &lists);

    let response = bench
        .pipeline
        .handle(query("nxdomain.example.org", RecordType::A), client())
        .await
        .unwrap();
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert_eq!(upstream.query_count(), 0);
}

#[tokio::test]
async fn default_blocking_mode_answers_null_ip() {
    let upstream = MockUpstream::start(&[]).await;
    let lists = vec![(1, vec!["||ads.example.com^".to_string()])];
    let bench = TestBench::build(DnsConfig::default(), &upstream.addr, &lists);

    let response = bench
        .pipeline
        .handle(query("tracker.ads.example.com", RecordType::A), client())
        .await
        .unwrap();
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        response.answers()[0].data().as_a().unwrap().0,
        Ipv4Addr::UNSPECIFIED
    );
}

#[tokio::test]
async fn hosts_entry_answers_locally() {
    let upstream = MockUpstream::start(&[]).await;
    let mut config = DnsConfig::default();
    config.hosts = vec!["127.0.0.1 host.example.org".to_string()];
    let bench = TestBench::build(config, &upstream.addr, &[]);

    let response = bench
        .pipeline
        .handle(query("host.example.org", RecordType::A), client())
        .await
        .unwrap();
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        response.answers()[0].data().as_a().unwrap().0,
        Ipv4Addr::LOCALHOST
    );
    assert_eq!(response.answers()[0].ttl(), 3600);
    assert_eq!(upstream.query_count(), 0);
}

#[tokio::test]
async fn second_lookup_served_from_cache() {
    let upstream =
        MockUpstream::start(&[("cached.example.com", "93.184.216.34".parse().unwrap())]).await;
    let bench = TestBench::build(DnsConfig::default(), &upstream.addr, &[]);

    bench
        .pipeline
        .handle(query("cached.example.com", RecordType::A), client())
        .await
        .unwrap();
    assert_eq!(upstream.query_count(), 1);

    let response = bench
        .pipeline
        .handle(query("cached.example.com", RecordType::A), client())
        .await
        .unwrap();
    assert_eq!(upstream.query_count(), 1, "second answer must come from cache");
    assert_eq!(response.answers().len(), 1);
}

#[tokio::test]
async fn cname_rewrite_restores_original_question() {
    let upstream =
        MockUpstream::start(&[("real.example.net", "10.9.9.9".parse().unwrap())]).await;
    let mut config = DnsConfig::default();
    config.rewrites = vec![RewriteRule {
        domain: "alias.lan".into(),
        answer: "real.example.net".into(),
    }];
    let bench = TestBench::build(config, &upstream.addr, &[]);

    let response = bench
        .pipeline
        .handle(query("alias.lan", RecordType::A), client())
        .await
        .unwrap();

    let qname = response.queries()[0].name().to_string();
    assert_eq!(qname.trim_end_matches('.'), "alias.lan");
    assert!(response.answers()[0].data().as_cname().is_some());
    assert!(response
        .answers()
        .iter()
        .any(|r| r.data().as_a().map(|a| a.0) == Some("10.9.9.9".parse().unwrap())));
}

#[tokio::test]
async fn response_filter_replaces_blocked_answer_ip() {
    let upstream =
        MockUpstream::start(&[("mixed.example.com", "6.6.6.6".parse().unwrap())]).await;
    let lists = vec![(1, vec!["6.6.6.6".to_string()])];
    let bench = TestBench::build(DnsConfig::default(), &upstream.addr, &lists);

    let response = bench
        .pipeline
        .handle(query("mixed.example.com", RecordType::A), client())
        .await
        .unwrap();
    // Null-IP default: the poisoned answer is replaced, not forwarded.
    assert_eq!(
        response.answers()[0].data().as_a().unwrap().0,
        Ipv4Addr::UNSPECIFIED
    );
}

#[tokio::test]
async fn rate_limit_drops_excess_queries() {
    let upstream = MockUpstream::start(&[("x.example.com", "10.0.0.1".parse().unwrap())]).await;
    let mut config = DnsConfig::default();
    config.ratelimit = 1;
    let bench = TestBench::build(config, &upstream.addr, &[]);

    let first = bench
        .pipeline
        .handle(query("x.example.com", RecordType::A), client())
        .await;
    assert!(first.is_some());
    let second = bench
        .pipeline
        .handle(query("x.example.com", RecordType::A), client())
        .await;
    assert!(second.is_none());
}

#[tokio::test]
async fn refuse_any_answers_refused() {
    let upstream = MockUpstream::start(&[]).await;
    let mut config = DnsConfig::default();
    config.refuse_any = true;
    let bench = TestBench::build(config, &upstream.addr, &[]);

    let response = bench
        .pipeline
        .handle(query("example.com", RecordType::ANY), client())
        .await
        .unwrap();
    assert_eq!(response.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn aaaa_disabled_answers_empty() {
    let upstream = MockUpstream::start(&[]).await;
    let mut config = DnsConfig::default();
    config.aaaa_disabled = true;
    let bench = TestBench::build(config, &upstream.addr, &[]);

    let response = bench
        .pipeline
        .handle(query("example.com", RecordType::AAAA), client())
        .await
        .unwrap();
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
    assert_eq!(upstream.query_count(), 0);
}

#[tokio::test]
async fn unreachable_upstream_yields_servfail() {
    // Nothing listens on this port; the dispatch budget expires.
    let mut config = DnsConfig::default();
    config.upstream_timeout_ms = 200;
    let bench = TestBench::build(config, "127.0.0.1:1", &[]);

    let response = bench
        .pipeline
        .handle(query("example.com", RecordType::A), client())
        .await
        .unwrap();
    assert_eq!(response.response_code(), ResponseCode::ServFail);
}

#[tokio::test]
async fn protection_disabled_skips_filters() {
    let upstream =
        MockUpstream::start(&[("ads.example.com", "1.2.3.4".parse().unwrap())]).await;
    let mut config = DnsConfig::default();
    config.protection_enabled = false;
    let lists = vec![(1, vec!["||ads.example.com^".to_string()])];
    let bench = TestBench::build(config, &upstream.addr, &lists);

    let response = bench
        .pipeline
        .handle(query("ads.example.com", RecordType::A), client())
        .await
        .unwrap();
    assert_eq!(
        response.answers()[0].data().as_a().unwrap().0,
        Ipv4Addr::new(1, 2, 3, 4)
    );
}
