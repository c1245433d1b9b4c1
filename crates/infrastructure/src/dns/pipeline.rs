//! The forwarder pipeline: every inbound question passes the same ordered
//! stage chain. A stage either short-circuits with a reply, signals a
//! silent drop, or lets the request continue. The final responder writes
//! once.

use crate::dns::access::AccessEngine;
use crate::dns::blocked::{self, BlockingPolicy};
use crate::dns::cache::{CacheKey, ResponseCache};
use crate::dns::filter::FilterEngine;
use crate::dns::ipset::IpsetEngine;
use crate::dns::ratelimit::RateLimiter;
use crate::dns::upstream::pool::UpstreamPool;
use homegate_application::ClientNameSource;
use homegate_domain::{DnsConfig, FilterResult};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Settings the pipeline reads per query; derived from the DNS config once
/// per reload.
pub struct PipelineSettings {
    pub protection_enabled: bool,
    pub refuse_any: bool,
    pub aaaa_disabled: bool,
    pub edns_client_subnet: bool,
    pub enable_dnssec: bool,
    pub blocking: BlockingPolicy,
    pub safe_browsing_block_host: String,
    pub parental_block_host: String,
}

impl PipelineSettings {
    pub fn from_config(config: &DnsConfig) -> Self {
        Self {
            protection_enabled: config.protection_enabled,
            refuse_any: config.refuse_any,
            aaaa_disabled: config.aaaa_disabled,
            edns_client_subnet: config.edns_client_subnet,
            enable_dnssec: config.enable_dnssec,
            blocking: BlockingPolicy {
                mode: config.blocking_mode,
                custom_v4: config.blocking_ipv4,
                custom_v6: config.blocking_ipv6,
                ttl: config.blocked_response_ttl,
            },
            safe_browsing_block_host: config.safe_browsing_block_host.clone(),
            parental_block_host: config.parental_block_host.clone(),
        }
    }
}

/// Everything one configuration generation needs to answer queries. The
/// server swaps whole pipelines on reload; in-flight requests finish on the
/// generation they started with.
pub struct Pipeline {
    pub(crate) settings: PipelineSettings,
    access: Arc<AccessEngine>,
    ratelimit: Arc<RateLimiter>,
    filter: Arc<FilterEngine>,
    cache: Option<Arc<ResponseCache>>,
    pool: Arc<UpstreamPool>,
    ipset: Option<Arc<IpsetEngine>>,
    client_names: Option<Arc<dyn ClientNameSource>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: PipelineSettings,
        access: Arc<AccessEngine>,
        ratelimit: Arc<RateLimiter>,
        filter: Arc<FilterEngine>,
        cache: Option<Arc<ResponseCache>>,
        pool: Arc<UpstreamPool>,
        ipset: Option<Arc<IpsetEngine>>,
        client_names: Option<Arc<dyn ClientNameSource>>,
    ) -> Self {
        Self {
            settings,
            access,
            ratelimit,
            filter,
            cache,
            pool,
            ipset,
            client_names,
        }
    }

    pub fn ratelimiter(&self) -> &RateLimiter {
        &self.ratelimit
    }

    /// Run one request through the stage chain. `None` means silent drop.
    pub async fn handle(
        &self,
        request: Message,
        client: SocketAddr,
    ) -> Option<Message> {
        // Stage 1: access gate.
        if !self.access.client_allowed(client.ip()) {
            debug!(client = %client.ip(), "Client refused by access rules, dropping");
            return None;
        }

        let query = request.queries().first()?.clone();
        let qname = normalized_name(query.name());
        if self.access.host_blocked(&qname) {
            debug!(client = %client.ip(), %qname, "Question refused by access rules, dropping");
            return None;
        }

        // Stage 2: rate limiter.
        if !self.ratelimit.allow(client.ip()) {
            return None;
        }

        if self.settings.refuse_any && query.query_type() == RecordType::ANY {
            return Some(blocked::empty_response(&request, ResponseCode::Refused));
        }
        if self.settings.aaaa_disabled && query.query_type() == RecordType::AAAA {
            return Some(blocked::empty_response(&request, ResponseCode::NoError));
        }

        // Stages 3-4: protection switch + request filter.
        let mut effective_name = qname.clone();
        let mut rewritten = false;
        if self.settings.protection_enabled {
            match self.request_filter(&request, &query, &qname).await {
                FilterStep::Respond(response) => return Some(response),
                FilterStep::Continue => {}
                FilterStep::ContinueAs(name) => {
                    effective_name = name;
                    rewritten = true;
                }
            }
        }

        // Stage 5: cache lookup.
        let cache_key = self.cache_key(&effective_name, &query, client.ip());
        if let Some(cache) = &self.cache {
            if let Some(mut cached) = cache.get(&cache_key) {
                debug!(%effective_name, "Cache hit");
                let mut header = *cached.header();
                header.set_id(request.id());
                cached.set_header(header);
                return Some(self.finish(&request, &query, cached, rewritten, &effective_name));
            }
        }

        // Stage 6: upstream dispatch.
        let outgoing = self.outgoing_query(&request, &effective_name, &query, client.ip())?;
        let dispatched = match self.pool.exchange(&outgoing).await {
            Ok(result) => {
                debug!(
                    %effective_name,
                    upstream = %result.upstream,
                    latency_ms = result.latency.as_millis() as u64,
                    "Upstream answered"
                );
                result.response
            }
            Err(e) => {
                warn!(%effective_name, error = %e, "Upstream dispatch failed");
                return Some(blocked::empty_response(&request, ResponseCode::ServFail));
            }
        };

        // Stage 7: response filter.
        if self.settings.protection_enabled {
            if let Some(replacement) = self.response_filter(&request, &dispatched).await {
                return Some(replacement);
            }
        }

        // Stage 8: ipset side-effect.
        if self.settings.protection_enabled {
            self.ipset_hook(&qname, &query, &dispatched);
        }

        // Stage 10: cache insert.
        if let Some(cache) = &self.cache {
            cache.insert(cache_key, &dispatched);
        }

        // Stage 9 + emit: restore the original question and write once.
        Some(self.finish(&request, &query, dispatched, rewritten, &effective_name))
    }

    fn cache_key(&self, name: &str, query: &Query, client: IpAddr) -> CacheKey {
        let ecs = self.settings.edns_client_subnet.then(|| match client {
            IpAddr::V4(v4) => {
                let masked = u32::from(v4) & 0xffff_ff00;
                (IpAddr::V4(masked.into()), 24u8)
            }
            IpAddr::V6(v6) => {
                let masked = u128::from(v6) & !((1u128 << 72) - 1);
                (IpAddr::V6(masked.into()), 56u8)
            }
        });
        CacheKey::new(name, query.query_type(), query.query_class()).with_ecs(ecs)
    }

    /// Build the upstream-bound query: the effective (possibly rewritten)
    /// name plus EDNS options per configuration.
    fn outgoing_query(
        &self,
        request: &Message,
        effective_name: &str,
        query: &Query,
        client: IpAddr,
    ) -> Option<Message> {
        let name = Name::from_str(&format!("{effective_name}.")).ok()?;
        let mut outgoing_query = Query::new();
        outgoing_query.set_name(name);
        outgoing_query.set_query_type(query.query_type());
        outgoing_query.set_query_class(query.query_class());

        let mut outgoing = Message::new(request.id(), MessageType::Query, OpCode::Query);
        outgoing.set_recursion_desired(true);
        outgoing.add_query(outgoing_query);

        if self.settings.enable_dnssec || self.settings.edns_client_subnet {
            let mut edns = hickory_proto::op::Edns::new();
            edns.set_max_payload(4096);
            edns.set_dnssec_ok(self.settings.enable_dnssec);
            if self.settings.edns_client_subnet {
                let (prefix, ip) = match client {
                    IpAddr::V4(_) => (24u8, client),
                    IpAddr::V6(_) => (56u8, client),
                };
                let data = ecs_payload(ip, prefix);
                edns.options_mut().insert(
                    hickory_proto::rr::rdata::opt::EdnsOption::Unknown(8, data),
                );
            }
            outgoing.set_edns(edns);
        }
        Some(outgoing)
    }

    async fn request_filter(
        &self,
        request: &Message,
        query: &Query,
        qname: &str,
    ) -> FilterStep {
        // Reverse questions consult the hosts file and the DHCP lease table.
        if query.query_type() == RecordType::PTR {
            if let Some(ip) = parse_reverse_name(qname) {
                let local = self
                    .filter
                    .check_reverse(ip)
                    .map(|h| h.to_string())
                    .or_else(|| {
                        self.client_names
                            .as_ref()
                            .and_then(|source| source.hostname_for_ip(ip))
                    });
                if let Some(host) = local {
                    return match blocked::synthesize_ptr(request, &host, self.settings.blocking.ttl)
                    {
                        Ok(response) => FilterStep::Respond(response),
                        Err(e) => {
                            warn!(%host, error = %e, "Bad PTR synthesis target");
                            FilterStep::Continue
                        }
                    };
                }
            }
        }

        match self.filter.check_host(qname) {
            FilterResult::NotFiltered | FilterResult::Allowed { .. } => FilterStep::Continue,
            FilterResult::HostsIps(ips) => FilterStep::Respond(blocked::synthesize_ips(
                request,
                &ips,
                self.settings.blocking.ttl,
            )),
            FilterResult::HostsPtr(host) => {
                match blocked::synthesize_ptr(request, &host, self.settings.blocking.ttl) {
                    Ok(response) => FilterStep::Respond(response),
                    Err(_) => FilterStep::Continue,
                }
            }
            FilterResult::Blocked { rule, .. } => {
                debug!(%qname, %rule, "Question blocked by filter");
                FilterStep::Respond(blocked::blocked_response(request, &self.settings.blocking))
            }
            FilterResult::SafeBrowsing => {
                let host = self.settings.safe_browsing_block_host.clone();
                FilterStep::Respond(self.block_host_response(request, &host).await)
            }
            FilterResult::Parental => {
                let host = self.settings.parental_block_host.clone();
                FilterStep::Respond(self.block_host_response(request, &host).await)
            }
            FilterResult::RewriteCname { canonical, .. } => {
                debug!(%qname, canonical = %canonical, "Question rewritten");
                FilterStep::ContinueAs(canonical.to_string())
            }
            FilterResult::RewriteIps(ips) => FilterStep::Respond(blocked::synthesize_ips(
                request,
                &ips,
                self.settings.blocking.ttl,
            )),
        }
    }

    /// Resolve the category block host and answer CNAME + A. Resolution
    /// failure degrades to a bare CNAME.
    async fn block_host_response(&self, request: &Message, block_host: &str) -> Message {
        let ips = self.resolve_block_host(block_host).await;
        blocked::synthesize_cname(request, block_host, &ips, self.settings.blocking.ttl)
            .unwrap_or_else(|_| blocked::blocked_response(request, &self.settings.blocking))
    }

    async fn resolve_block_host(&self, block_host: &str) -> Vec<IpAddr> {
        let Ok(name) = Name::from_str(&format!("{}.", block_host.trim_end_matches('.'))) else {
            return Vec::new();
        };
        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(RecordType::A);
        let mut probe = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
        probe.set_recursion_desired(true);
        probe.add_query(query);

        match self.pool.exchange(&probe).await {
            Ok(result) => result
                .response
                .answers()
                .iter()
                .filter_map(|r| match r.data() {
                    RData::A(a) => Some(IpAddr::V4(a.0)),
                    RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                debug!(host = block_host, error = %e, "Block-host resolution failed");
                Vec::new()
            }
        }
    }

    /// Walk CNAME targets and answered addresses; any filter hit replaces
    /// the reply using the request-filter policy under the original
    /// question.
    async fn response_filter(&self, request: &Message, response: &Message) -> Option<Message> {
        for record in response.answers() {
            let hit = match record.data() {
                RData::CNAME(CNAME(target)) => {
                    let target = normalized_name(target);
                    matches!(
                        self.filter.check_host(&target),
                        FilterResult::Blocked { .. }
                            | FilterResult::SafeBrowsing
                            | FilterResult::Parental
                    )
                }
                RData::A(a) => self.filter.check_ip(IpAddr::V4(a.0)).is_filtered(),
                RData::AAAA(aaaa) => self.filter.check_ip(IpAddr::V6(aaaa.0)).is_filtered(),
                _ => false,
            };
            if hit {
                debug!(id = request.id(), "Answer replaced by response filter");
                return Some(blocked::blocked_response(request, &self.settings.blocking));
            }
        }
        None
    }

    fn ipset_hook(&self, qname: &str, query: &Query, response: &Message) {
        let Some(engine) = &self.ipset else {
            return;
        };
        if engine.is_empty() {
            return;
        }
        if !matches!(
            query.query_type(),
            RecordType::A | RecordType::AAAA | RecordType::ANY
        ) {
            return;
        }
        let answers: Vec<(IpAddr, u32)> = response
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                RData::A(a) => Some((IpAddr::V4(a.0), r.ttl())),
                RData::AAAA(aaaa) => Some((IpAddr::V6(aaaa.0), r.ttl())),
                _ => None,
            })
            .collect();
        if answers.is_empty() {
            return;
        }
        let engine = Arc::clone(engine);
        let qname = qname.to_string();
        // The netlink channel is synchronous; keep it off the worker.
        tokio::task::spawn_blocking(move || engine.process(&qname, &answers));
    }

    /// The single response-writing point: restore the original question
    /// after a CNAME rewrite and stamp the client's id.
    fn finish(
        &self,
        request: &Message,
        original_query: &Query,
        mut response: Message,
        rewritten: bool,
        effective_name: &str,
    ) -> Message {
        let mut header = *response.header();
        header.set_id(request.id());
        header.set_message_type(MessageType::Response);
        response.set_header(header);
        response.set_recursion_available(true);

        if rewritten {
            let original_name = original_query.name().clone();
            let canonical = Name::from_str(&format!("{effective_name}."))
                .unwrap_or_else(|_| original_name.clone());
            let ttl = response
                .answers()
                .first()
                .map(|r| r.ttl())
                .unwrap_or(self.settings.blocking.ttl);

            let mut restored = blocked::response_template(request);
            restored.set_response_code(response.response_code());
            restored.add_answer(Record::from_rdata(
                original_name,
                ttl,
                RData::CNAME(CNAME(canonical)),
            ));
            for answer in response.answers() {
                restored.add_answer(answer.clone());
            }
            return restored;
        }

        // Echo the original question section verbatim.
        let queries: Vec<Query> = response.queries().to_vec();
        if queries.is_empty() {
            for query in request.queries() {
                response.add_query(query.clone());
            }
        }
        response
    }
}

enum FilterStep {
    Continue,
    ContinueAs(String),
    Respond(Message),
}

/// Lower-cased, dot-trimmed representation used for all matching.
pub fn normalized_name(name: &Name) -> String {
    name.to_string().trim_end_matches('.').to_lowercase()
}

fn ecs_payload(subnet: IpAddr, prefix: u8) -> Vec<u8> {
    let (family, octets): (u16, Vec<u8>) = match subnet {
        IpAddr::V4(v4) => (1, v4.octets().to_vec()),
        IpAddr::V6(v6) => (2, v6.octets().to_vec()),
    };
    let addr_len = prefix.div_ceil(8) as usize;
    let mut data = Vec::with_capacity(4 + addr_len);
    data.extend_from_slice(&family.to_be_bytes());
    data.push(prefix);
    data.push(0);
    data.extend_from_slice(&octets[..addr_len]);
    data
}

/// Parse `d.c.b.a.in-addr.arpa` / nibble-form `ip6.arpa` names.
pub fn parse_reverse_name(qname: &str) -> Option<IpAddr> {
    if let Some(rest) = qname.strip_suffix(".in-addr.arpa") {
        let mut octets = [0u8; 4];
        let labels: Vec<&str> = rest.split('.').collect();
        if labels.len() != 4 {
            return None;
        }
        for (i, label) in labels.iter().enumerate() {
            octets[3 - i] = label.parse().ok()?;
        }
        return Some(IpAddr::V4(octets.into()));
    }
    if let Some(rest) = qname.strip_suffix(".ip6.arpa") {
        let nibbles: Vec<&str> = rest.split('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        let mut value: u128 = 0;
        // Nibbles arrive least-significant first.
        for nibble in nibbles.iter().rev() {
            let digit = u128::from_str_radix(nibble, 16).ok()?;
            if nibble.len() != 1 {
                return None;
            }
            value = (value << 4) | digit;
        }
        return Some(IpAddr::V6(value.into()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_v4_name() {
        assert_eq!(
            parse_reverse_name("10.1.168.192.in-addr.arpa"),
            Some("192.168.1.10".parse().unwrap())
        );
        assert_eq!(parse_reverse_name("1.168.192.in-addr.arpa"), None);
    }

    #[test]
    fn reverse_v6_name() {
        let name = "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.d.f.ip6.arpa";
        assert_eq!(parse_reverse_name(name), Some("fd00::1".parse().unwrap()));
    }

    #[test]
    fn ecs_payload_masks_to_prefix() {
        let data = ecs_payload("192.168.1.77".parse().unwrap(), 24);
        assert_eq!(data, vec![0, 1, 24, 0, 192, 168, 1]);
    }
}
