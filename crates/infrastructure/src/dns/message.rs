//! Wire-format helpers on top of `hickory-proto`.

use homegate_domain::DomainError;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use std::net::IpAddr;
use std::str::FromStr;

/// EDNS0 option code for Client Subnet (RFC 7871).
const EDNS_CLIENT_SUBNET: u16 = 8;

pub fn serialize(message: &Message) -> Result<Vec<u8>, DomainError> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message
        .emit(&mut encoder)
        .map_err(|e| DomainError::InvalidDnsResponse(format!("serialize DNS message: {e}")))?;
    Ok(buf)
}

pub fn parse(bytes: &[u8]) -> Result<Message, DomainError> {
    Message::from_bytes(bytes)
        .map_err(|e| DomainError::InvalidDnsResponse(format!("parse DNS message: {e}")))
}

fn ecs_option_data(subnet: IpAddr, prefix: u8) -> Vec<u8> {
    let (family, octets): (u16, Vec<u8>) = match subnet {
        IpAddr::V4(v4) => (1, v4.octets().to_vec()),
        IpAddr::V6(v6) => (2, v6.octets().to_vec()),
    };
    let addr_len = prefix.div_ceil(8) as usize;
    let mut data = Vec::with_capacity(4 + addr_len);
    data.extend_from_slice(&family.to_be_bytes());
    data.push(prefix);
    data.push(0); // scope prefix, zero on queries
    data.extend_from_slice(&octets[..addr_len]);
    data
}

/// Build an outgoing recursive query in wire format.
///
/// RD is set; `dnssec_ok` adds an OPT record with the DO bit; `ecs`
/// attaches the client-subnet option.
pub fn build_query(
    name: &str,
    rtype: RecordType,
    dnssec_ok: bool,
    ecs: Option<(IpAddr, u8)>,
) -> Result<Vec<u8>, DomainError> {
    let name = Name::from_str(name)
        .map_err(|e| DomainError::InvalidDomainName(format!("'{name}': {e}")))?;

    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(rtype);
    query.set_query_class(hickory_proto::rr::DNSClass::IN);

    let mut message = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);

    if dnssec_ok || ecs.is_some() {
        let mut edns = Edns::new();
        edns.set_max_payload(4096);
        edns.set_dnssec_ok(dnssec_ok);
        if let Some((subnet, prefix)) = ecs {
            edns.options_mut().insert(EdnsOption::Unknown(
                EDNS_CLIENT_SUBNET,
                ecs_option_data(subnet, prefix),
            ));
        }
        message.set_edns(edns);
    }

    serialize(&message)
}

/// Re-encode `message` under a fresh random id, returning (id, bytes).
pub fn reissue(message: &Message) -> Result<(u16, Vec<u8>), DomainError> {
    let mut message = message.clone();
    let id = fastrand::u16(..);
    let mut header = *message.header();
    header.set_id(id);
    message.set_header(header);
    Ok((id, serialize(&message)?))
}
