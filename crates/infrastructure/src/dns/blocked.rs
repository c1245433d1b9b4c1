use homegate_domain::{BlockingMode, DomainError};
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// How filtered queries are answered; derived from the DNS configuration.
#[derive(Debug, Clone)]
pub struct BlockingPolicy {
    pub mode: BlockingMode,
    pub custom_v4: Option<Ipv4Addr>,
    pub custom_v6: Option<Ipv6Addr>,
    pub ttl: u32,
}

impl BlockingPolicy {
    fn null_v4(&self) -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    fn null_v6(&self) -> Ipv6Addr {
        Ipv6Addr::UNSPECIFIED
    }
}

/// Start a response from the question: same id, question echoed, RA set.
pub fn response_template(request: &Message) -> Message {
    let mut response = Message::new(request.id(), MessageType::Response, OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

/// An empty answer with the given response code.
pub fn empty_response(request: &Message, code: ResponseCode) -> Message {
    let mut response = response_template(request);
    response.set_response_code(code);
    response
}

fn rdata_for(ip: IpAddr) -> RData {
    match ip {
        IpAddr::V4(v4) => RData::A(A::from(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA::from(v6)),
    }
}

/// Answer with the subset of `ips` matching the question type.
pub fn synthesize_ips(request: &Message, ips: &[IpAddr], ttl: u32) -> Message {
    let mut response = response_template(request);
    if let Some(query) = request.queries().first() {
        let owner = query.name().clone();
        for ip in ips {
            let wanted = match query.query_type() {
                RecordType::A => ip.is_ipv4(),
                RecordType::AAAA => ip.is_ipv6(),
                RecordType::ANY => true,
                _ => false,
            };
            if wanted {
                response.add_answer(Record::from_rdata(owner.clone(), ttl, rdata_for(*ip)));
            }
        }
    }
    response
}

/// CNAME to `canonical` followed by that host's addresses; used for the
/// safe-browsing and parental block hosts.
pub fn synthesize_cname(
    request: &Message,
    canonical: &str,
    ips: &[IpAddr],
    ttl: u32,
) -> Result<Message, DomainError> {
    let target = Name::from_str(canonical)
        .map_err(|e| DomainError::InvalidDomainName(format!("{canonical}: {e}")))?;
    let mut response = response_template(request);
    if let Some(query) = request.queries().first() {
        response.add_answer(Record::from_rdata(
            query.name().clone(),
            ttl,
            RData::CNAME(CNAME(target.clone())),
        ));
        for ip in ips {
            response.add_answer(Record::from_rdata(target.clone(), ttl, rdata_for(*ip)));
        }
    }
    Ok(response)
}

/// PTR answer for a reverse question.
pub fn synthesize_ptr(request: &Message, host: &str, ttl: u32) -> Result<Message, DomainError> {
    let target = Name::from_str(&format!("{}.", host.trim_end_matches('.')))
        .map_err(|e| DomainError::InvalidDomainName(format!("{host}: {e}")))?;
    let mut response = response_template(request);
    if let Some(query) = request.queries().first() {
        response.add_answer(Record::from_rdata(
            query.name().clone(),
            ttl,
            RData::PTR(PTR(target)),
        ));
    }
    Ok(response)
}

/// Answer a blocked question per the blocking mode.
///
/// An unset mode behaves as NULL-IP for address questions and as an empty
/// success for everything else.
pub fn blocked_response(request: &Message, policy: &BlockingPolicy) -> Message {
    let qtype = request
        .queries()
        .first()
        .map(Query::query_type)
        .unwrap_or(RecordType::A);

    match policy.mode {
        BlockingMode::NxDomain => empty_response(request, ResponseCode::NXDomain),
        BlockingMode::Refused => empty_response(request, ResponseCode::Refused),
        BlockingMode::CustomIp => {
            let ips: Vec<IpAddr> = policy
                .custom_v4
                .map(IpAddr::V4)
                .into_iter()
                .chain(policy.custom_v6.map(IpAddr::V6))
                .collect();
            synthesize_ips(request, &ips, policy.ttl)
        }
        BlockingMode::NullIp | BlockingMode::Default => match qtype {
            RecordType::A => synthesize_ips(
                request,
                &[IpAddr::V4(policy.null_v4())],
                policy.ttl,
            ),
            RecordType::AAAA => synthesize_ips(
                request,
                &[IpAddr::V6(policy.null_v6())],
                policy.ttl,
            ),
            _ => empty_response(request, ResponseCode::NoError),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(name: &str, rtype: RecordType) -> Message {
        let mut message = Message::new(77, MessageType::Query, OpCode::Query);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(rtype);
        message.add_query(q);
        message.set_recursion_desired(true);
        message
    }

    fn policy(mode: BlockingMode) -> BlockingPolicy {
        BlockingPolicy {
            mode,
            custom_v4: None,
            custom_v6: None,
            ttl: 3600,
        }
    }

    #[test]
    fn nxdomain_mode() {
        let response = blocked_response(&query("ads.example.", RecordType::A), &policy(BlockingMode::NxDomain));
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
        assert_eq!(response.id(), 77);
    }

    #[test]
    fn default_mode_nulls_a() {
        let response = blocked_response(&query("ads.example.", RecordType::A), &policy(BlockingMode::Default));
        assert_eq!(response.answers().len(), 1);
        assert_eq!(
            response.answers()[0].data().as_a().unwrap().0,
            Ipv4Addr::UNSPECIFIED
        );
        assert_eq!(response.answers()[0].ttl(), 3600);
    }

    #[test]
    fn default_mode_empty_success_for_txt() {
        let response = blocked_response(&query("ads.example.", RecordType::TXT), &policy(BlockingMode::Default));
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn custom_ip_mode() {
        let mut p = policy(BlockingMode::CustomIp);
        p.custom_v4 = Some("10.0.0.10".parse().unwrap());
        let response = blocked_response(&query("ads.example.", RecordType::A), &p);
        assert_eq!(
            response.answers()[0].data().as_a().unwrap().0,
            "10.0.0.10".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn cname_chain_carries_block_host() {
        let request = query("bad.example.", RecordType::A);
        let response = synthesize_cname(
            &request,
            "standard-block.dns.example.",
            &["94.140.14.35".parse().unwrap()],
            300,
        )
        .unwrap();
        assert_eq!(response.answers().len(), 2);
        assert!(response.answers()[0].data().as_cname().is_some());
    }

    #[test]
    fn ip_synthesis_respects_qtype() {
        let request = query("dual.example.", RecordType::AAAA);
        let ips: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "fd00::1".parse().unwrap()];
        let response = synthesize_ips(&request, &ips, 60);
        assert_eq!(response.answers().len(), 1);
        assert!(response.answers()[0].data().as_aaaa().is_some());
    }
}
