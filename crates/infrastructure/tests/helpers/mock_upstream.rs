//! A tiny in-process DNS upstream for pipeline tests.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Answers A/AAAA queries from a fixed name → IP map; everything else gets
/// NXDOMAIN. Counts the queries it serves.
pub struct MockUpstream {
    pub addr: String,
    queries: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub async fn start(records: &[(&str, IpAddr)]) -> MockUpstream {
        let map: HashMap<String, IpAddr> = records
            .iter()
            .map(|(name, ip)| (name.trim_end_matches('.').to_lowercase(), *ip))
            .collect();
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock upstream");
        let addr = socket.local_addr().unwrap().to_string();
        let queries = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&queries);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(request) = Message::from_bytes(&buf[..len]) else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let mut response =
                    Message::new(request.id(), MessageType::Response, OpCode::Query);
                response.set_recursion_available(true);
                for query in request.queries() {
                    response.add_query(query.clone());
                }

                match request.queries().first() {
                    Some(query) => {
                        let name = query.name().to_string().trim_end_matches('.').to_lowercase();
                        match (map.get(&name), query.query_type()) {
                            (Some(IpAddr::V4(ip)), RecordType::A) => {
                                response.add_answer(Record::from_rdata(
                                    query.name().clone(),
                                    300,
                                    RData::A(A::from(*ip)),
                                ));
                            }
                            (Some(IpAddr::V6(ip)), RecordType::AAAA) => {
                                response.add_answer(Record::from_rdata(
                                    query.name().clone(),
                                    300,
                                    RData::AAAA(AAAA::from(*ip)),
                                ));
                            }
                            (Some(_), _) => {}
                            (None, _) => {
                                response.set_response_code(ResponseCode::NXDomain);
                            }
                        }
                    }
                    None => {
                        response.set_response_code(ResponseCode::FormErr);
                    }
                }

                let mut out = Vec::with_capacity(512);
                let mut encoder = BinEncoder::new(&mut out);
                if response.emit(&mut encoder).is_ok() {
                    let _ = socket.send_to(&out, peer).await;
                }
            }
        });

        MockUpstream { addr, queries }
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}
