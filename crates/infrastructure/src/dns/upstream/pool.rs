use super::bootstrap::Bootstrapper;
use super::{ExchangeReply, Upstream};
use crate::dns::blocked;
use crate::dns::message;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use homegate_domain::{DomainError, UpstreamPolicy, UpstreamSpec};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Probe target port for fastest-address measurement.
const PROBE_PORT: u16 = 80;

/// A dispatched answer and the upstream that produced it.
pub struct DispatchResult {
    pub response: Message,
    pub upstream: Arc<str>,
    pub latency: Duration,
}

/// The configured upstream group and its dispatch policy.
pub struct UpstreamPool {
    upstreams: Vec<Arc<Upstream>>,
    policy: UpstreamPolicy,
    bootstrap: Arc<Bootstrapper>,
    timeout: Duration,
    bogus_nxdomain: Vec<IpAddr>,
}

impl UpstreamPool {
    pub fn new(
        addresses: &[String],
        policy: UpstreamPolicy,
        bootstrap: Arc<Bootstrapper>,
        timeout: Duration,
        bogus_nxdomain: Vec<IpAddr>,
    ) -> Result<Self, DomainError> {
        if addresses.is_empty() {
            return Err(DomainError::InvalidConfig(
                "at least one upstream must be configured".into(),
            ));
        }
        let upstreams = addresses
            .iter()
            .map(|a| a.parse::<UpstreamSpec>().map(|s| Arc::new(Upstream::new(s))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            upstreams,
            policy,
            bootstrap,
            timeout,
            bogus_nxdomain,
        })
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    /// Dispatch `query` per the pool policy. The query is re-issued under a
    /// fresh id; the caller restores the client's id on the way out.
    pub async fn exchange(&self, query: &Message) -> Result<DispatchResult, DomainError> {
        let (_, query_bytes) = message::reissue(query)?;
        let query_bytes: Arc<[u8]> = Arc::from(query_bytes);

        let mut result = match self.policy {
            UpstreamPolicy::LoadBalance => self.load_balance(&query_bytes).await?,
            UpstreamPolicy::Parallel => self.parallel(&query_bytes).await?,
            UpstreamPolicy::FastestAddr => self.fastest_addr(&query_bytes).await?,
        };

        if self.contains_bogus(&result.response) {
            debug!(upstream = %result.upstream, "Answer contains a bogus-NXDOMAIN address");
            result.response = blocked::empty_response(&result.response, ResponseCode::NXDomain);
        }
        Ok(result)
    }

    fn contains_bogus(&self, response: &Message) -> bool {
        if self.bogus_nxdomain.is_empty() {
            return false;
        }
        answer_ips(response).any(|ip| self.bogus_nxdomain.contains(&ip))
    }

    /// Lowest decayed RTT first; failures are penalized by the upstream
    /// itself and the next candidate is tried within the remaining budget.
    async fn load_balance(&self, query_bytes: &[u8]) -> Result<DispatchResult, DomainError> {
        let deadline = Instant::now() + self.timeout;
        let mut order: Vec<&Arc<Upstream>> = self.upstreams.iter().collect();
        order.sort_by(|a, b| a.rtt_us().total_cmp(&b.rtt_us()));

        let mut last_error = None;
        for upstream in order {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match upstream.exchange(query_bytes, remaining, &self.bootstrap).await {
                Ok(reply) => {
                    return Ok(DispatchResult {
                        response: reply.response,
                        upstream: upstream.display(),
                        latency: reply.latency,
                    })
                }
                Err(e) => {
                    debug!(upstream = %upstream.display(), error = %e, "Upstream failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(DomainError::AllUpstreamsFailed))
    }

    fn spawn_all(
        &self,
        query_bytes: &Arc<[u8]>,
    ) -> (
        FuturesUnordered<tokio::task::JoinHandle<Result<(usize, ExchangeReply), (usize, DomainError)>>>,
        Vec<tokio::task::AbortHandle>,
    ) {
        let futs = FuturesUnordered::new();
        let mut abort_handles = Vec::with_capacity(self.upstreams.len());
        for (i, upstream) in self.upstreams.iter().enumerate() {
            let upstream = Arc::clone(upstream);
            let bootstrap = Arc::clone(&self.bootstrap);
            let query_bytes = Arc::clone(query_bytes);
            let timeout = self.timeout;
            let handle = tokio::spawn(async move {
                upstream
                    .exchange(&query_bytes, timeout, &bootstrap)
                    .await
                    .map(|r| (i, r))
                    .map_err(|e| (i, e))
            });
            abort_handles.push(handle.abort_handle());
            futs.push(handle);
        }
        (futs, abort_handles)
    }

    /// Race all upstreams; first success wins and the siblings are aborted.
    async fn parallel(&self, query_bytes: &Arc<[u8]>) -> Result<DispatchResult, DomainError> {
        let (mut futs, abort_handles) = self.spawn_all(query_bytes);

        let result = tokio::time::timeout(self.timeout, async {
            let mut first_error = None;
            while let Some(joined) = futs.next().await {
                match joined {
                    Ok(Ok((i, reply))) => {
                        return Ok(DispatchResult {
                            response: reply.response,
                            upstream: self.upstreams[i].display(),
                            latency: reply.latency,
                        });
                    }
                    Ok(Err((i, e))) => {
                        debug!(upstream = %self.upstreams[i].display(), error = %e, "Parallel branch failed");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(e) => warn!(error = %e, "Parallel branch panicked"),
                }
            }
            Err(first_error.unwrap_or(DomainError::AllUpstreamsFailed))
        })
        .await;

        for handle in &abort_handles {
            handle.abort();
        }

        result.map_err(|_| DomainError::QueryTimeout)?
    }

    /// Race all upstreams, then pick the answer whose address responds
    /// fastest to a short TCP probe. Falls back to the first answer when no
    /// probe succeeds within the budget.
    async fn fastest_addr(&self, query_bytes: &Arc<[u8]>) -> Result<DispatchResult, DomainError> {
        let (mut futs, abort_handles) = self.spawn_all(query_bytes);

        let deadline = Instant::now() + self.timeout;
        let mut replies: Vec<(usize, ExchangeReply)> = Vec::new();
        let mut first_error = None;

        // Collect every answer that arrives within the budget.
        while let Ok(Some(joined)) =
            tokio::time::timeout_at(deadline.into(), futs.next()).await
        {
            match joined {
                Ok(Ok(reply)) => replies.push(reply),
                Ok(Err((_, e))) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => warn!(error = %e, "Fastest-address branch panicked"),
            }
        }
        for handle in &abort_handles {
            handle.abort();
        }

        if replies.is_empty() {
            return Err(first_error.unwrap_or(DomainError::QueryTimeout));
        }

        let mut candidates: Vec<IpAddr> = Vec::new();
        for (_, reply) in &replies {
            for ip in answer_ips(&reply.response) {
                if !candidates.contains(&ip) {
                    candidates.push(ip);
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Some(fastest) = probe_fastest(&candidates, remaining).await {
            if let Some(pos) = replies
                .iter()
                .position(|(_, r)| answer_ips(&r.response).any(|ip| ip == fastest))
            {
                let (i, reply) = replies.swap_remove(pos);
                debug!(ip = %fastest, upstream = %self.upstreams[i].display(), "Fastest address selected");
                return Ok(DispatchResult {
                    response: reply.response,
                    upstream: self.upstreams[i].display(),
                    latency: reply.latency,
                });
            }
        }

        let (i, reply) = replies.remove(0);
        Ok(DispatchResult {
            response: reply.response,
            upstream: self.upstreams[i].display(),
            latency: reply.latency,
        })
    }
}

fn answer_ips(response: &Message) -> impl Iterator<Item = IpAddr> + '_ {
    response.answers().iter().filter_map(|r| match r.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}

/// Measure TCP reachability of each candidate; the first completed
/// handshake wins.
async fn probe_fastest(candidates: &[IpAddr], budget: Duration) -> Option<IpAddr> {
    if candidates.is_empty() || budget.is_zero() {
        return None;
    }
    let mut probes = FuturesUnordered::new();
    for &ip in candidates {
        probes.push(async move {
            let started = Instant::now();
            TcpStream::connect(SocketAddr::new(ip, PROBE_PORT))
                .await
                .ok()
                .map(|_| (ip, started.elapsed()))
        });
    }

    tokio::time::timeout(budget, async {
        while let Some(outcome) = probes.next().await {
            if let Some((ip, elapsed)) = outcome {
                debug!(%ip, ?elapsed, "Reachability probe succeeded");
                return Some(ip);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
