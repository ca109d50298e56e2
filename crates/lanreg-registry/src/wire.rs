//! Mapping between node announcements and DNS-format messages.
//!
//! Every announce packet is self-describing: it carries the PTR from the
//! service type to the node instance, the instance SRV (port and target), an
//! A/AAAA record when the node address is an IP, and a TXT record holding a
//! subset of the node's record chunks. The message ID carries the record id so
//! receivers can group chunks that were split across packets.

use bytes::Bytes;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::{A, AAAA, PTR, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use lanreg_codec::{CodecError, DiscoveryRecord, RecordCodec};
use lanreg_core::types::{Node, Service};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Service type used to browse every service in a domain.
const ALL_SERVICES: &str = "_services._dns-sd._udp";

/// Longest domain name in presentation form, without the root dot.
const MAX_NAME_LEN: usize = 253;

/// Errors raised while building or reading discovery messages
#[derive(Debug, Error)]
pub enum WireError {
    /// The DNS message could not be encoded or decoded
    #[error("DNS message error: {0}")]
    Dns(#[from] ProtoError),

    /// A service or node name does not form a valid domain name
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// The message does not fit into one datagram
    #[error("message of {size} bytes exceeds packet limit of {max} bytes")]
    Oversized { size: usize, max: usize },

    /// The node address is not host:port
    #[error("address '{0}' is not host:port")]
    InvalidAddress(String),
}

fn to_name(name: &str) -> Result<Name, WireError> {
    let invalid = |reason: String| WireError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.trim_end_matches('.').len() > MAX_NAME_LEN {
        return Err(invalid(format!("longer than {} bytes", MAX_NAME_LEN)));
    }
    Name::from_ascii(name).map_err(|e| invalid(e.to_string()))
}

/// Builds and parses names within one discovery domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    domain: String,
}

impl Naming {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.trim_end_matches('.').to_string(),
        }
    }

    /// `_<service>._udp.<domain>.`
    pub fn service_type(&self, service: &str) -> String {
        format!("_{}._udp.{}.", service, self.domain)
    }

    /// `<node>._<service>._udp.<domain>.`
    pub fn instance(&self, service: &str, node_id: &str) -> String {
        format!("{}.{}", node_id, self.service_type(service))
    }

    /// `_services._dns-sd._udp.<domain>.`
    pub fn all_services(&self) -> String {
        format!("{}.{}.", ALL_SERVICES, self.domain)
    }

    /// Extracts the service name from a service type name in this domain.
    pub fn parse_service_type<'a>(&self, name: &'a str) -> Option<&'a str> {
        let suffix = format!("._udp.{}.", self.domain);
        name.strip_suffix(suffix.as_str())?
            .strip_prefix('_')
            .filter(|service| !service.is_empty())
    }

    /// Checks that every node of the service yields encodable names.
    pub fn check(&self, service: &Service) -> Result<(), WireError> {
        for node in &service.nodes {
            if node.id.contains('.') {
                return Err(WireError::InvalidName {
                    name: node.id.clone(),
                    reason: "node ids cannot contain dots".to_string(),
                });
            }
            to_name(&self.instance(&service.name, &node.id))?;
        }
        Ok(())
    }
}

/// The encoded form of one node of a service, ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Single-node snapshot of the announced service
    pub service: Service,
    pub node: Node,
    pub record_id: u16,
    pub chunks: Vec<String>,
}

impl Announcement {
    /// Encodes the record for `node` of `service`.
    pub fn new(service: &Service, node: &Node, codec: &RecordCodec) -> Result<Self, CodecError> {
        let chunks = codec.encode(&DiscoveryRecord::for_node(service, node))?;
        Ok(Self {
            service: service.with_single_node(node),
            node: node.clone(),
            record_id: record_id(&chunks),
            chunks,
        })
    }

    /// Builds the announce packets, packing as many chunks per packet as fit
    /// within `max_packet_size`.
    pub fn packets(
        &self,
        naming: &Naming,
        ttl_secs: u32,
        max_packet_size: usize,
    ) -> Result<Vec<Bytes>, WireError> {
        let base = self.base_message(naming, ttl_secs)?;
        let instance = to_name(&naming.instance(&self.service.name, &self.node.id))?;
        let encode = |group: &[String]| -> Result<Vec<u8>, WireError> {
            let mut message = base.clone();
            message.add_answer(Record::from_rdata(
                instance.clone(),
                ttl_secs,
                RData::TXT(TXT::new(group.to_vec())),
            ));
            Ok(message.to_vec()?)
        };

        let mut packets = Vec::new();
        let mut group: Vec<String> = Vec::new();
        let mut pending: Option<Vec<u8>> = None;
        for chunk in &self.chunks {
            group.push(chunk.clone());
            let packet = encode(&group)?;
            if packet.len() <= max_packet_size {
                pending = Some(packet);
                continue;
            }

            // flush what fit and start a new packet with this chunk
            let Some(full) = pending.take() else {
                return Err(WireError::Oversized {
                    size: packet.len(),
                    max: max_packet_size,
                });
            };
            packets.push(Bytes::from(full));
            group = vec![chunk.clone()];
            let packet = encode(&group)?;
            if packet.len() > max_packet_size {
                return Err(WireError::Oversized {
                    size: packet.len(),
                    max: max_packet_size,
                });
            }
            pending = Some(packet);
        }
        packets.extend(pending.map(Bytes::from));
        Ok(packets)
    }

    /// Builds the zero-TTL packet announcing that the node is leaving.
    pub fn goodbye_packet(&self, naming: &Naming, max_packet_size: usize) -> Result<Bytes, WireError> {
        let packet = self.base_message(naming, 0)?.to_vec()?;
        if packet.len() > max_packet_size {
            return Err(WireError::Oversized {
                size: packet.len(),
                max: max_packet_size,
            });
        }
        Ok(Bytes::from(packet))
    }

    fn base_message(&self, naming: &Naming, ttl_secs: u32) -> Result<Message, WireError> {
        let (host, port) = self
            .node
            .host_port()
            .ok_or_else(|| WireError::InvalidAddress(self.node.address.clone()))?;
        let service_type = to_name(&naming.service_type(&self.service.name))?;
        let instance = to_name(&naming.instance(&self.service.name, &self.node.id))?;

        let ip = host.parse::<IpAddr>().ok();
        let target = match ip {
            Some(_) => instance.clone(),
            None => to_name(&format!("{}.", host.trim_end_matches('.')))?,
        };

        let mut message = Message::new();
        message
            .set_id(self.record_id)
            .set_message_type(MessageType::Response)
            .set_authoritative(true);
        message.add_answer(Record::from_rdata(
            service_type,
            ttl_secs,
            RData::PTR(PTR(instance.clone())),
        ));
        message.add_answer(Record::from_rdata(
            instance.clone(),
            ttl_secs,
            RData::SRV(SRV::new(0, 0, port, target)),
        ));
        match ip {
            Some(IpAddr::V4(v4)) => {
                message.add_answer(Record::from_rdata(instance, ttl_secs, RData::A(A(v4))));
            }
            Some(IpAddr::V6(v6)) => {
                message.add_answer(Record::from_rdata(instance, ttl_secs, RData::AAAA(AAAA(v6))));
            }
            None => {}
        }
        Ok(message)
    }
}

/// 16-bit FNV-1a fold over the chunk set.
pub fn record_id(chunks: &[String]) -> u16 {
    let mut hash: u32 = 0x811c_9dc5;
    for chunk in chunks {
        for byte in chunk.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
    }
    ((hash >> 16) ^ (hash & 0xffff)) as u16
}

/// Builds a PTR question for a service type or the all-services name.
pub fn query_message(name: &str) -> Result<Message, WireError> {
    let mut message = Message::new();
    message
        .set_message_type(MessageType::Query)
        .add_query(Query::query(to_name(name)?, RecordType::PTR));
    Ok(message)
}

/// Encoded form of [`query_message`].
pub fn query_packet(name: &str) -> Result<Bytes, WireError> {
    Ok(Bytes::from(query_message(name)?.to_vec()?))
}

/// Parses a received datagram.
pub fn decode(data: &[u8]) -> Result<Message, WireError> {
    Ok(Message::from_vec(data)?)
}

/// Part of an announcement received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub service: String,
    pub node_id: String,
    pub record_id: u16,
    pub ttl_secs: u32,
    pub address: String,
    pub chunks: Vec<String>,
}

/// What a received message asks of us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Re-announce local nodes, all or those of one service
    Query { service: Option<String> },
    Fragment(Fragment),
    Goodbye { service: String, node_id: String },
}

/// Extracts everything in our domain from a message. Records for other
/// domains and incomplete instances are skipped.
pub fn parse(message: &Message, naming: &Naming) -> Vec<Inbound> {
    if message.message_type() == MessageType::Query {
        let all = naming.all_services();
        return message
            .queries()
            .iter()
            .filter_map(|query| {
                let name = query.name().to_ascii();
                if name == all {
                    Some(Inbound::Query { service: None })
                } else {
                    naming
                        .parse_service_type(&name)
                        .map(|service| Inbound::Query {
                            service: Some(service.to_string()),
                        })
                }
            })
            .collect();
    }

    let answers: Vec<(String, &Record)> = message
        .answers()
        .iter()
        .map(|record| (record.name().to_ascii(), record))
        .collect();

    let mut inbound = Vec::new();
    for (owner, record) in &answers {
        let Some(RData::PTR(PTR(target))) = record.data() else {
            continue;
        };
        let Some(service) = naming.parse_service_type(owner) else {
            continue;
        };
        let instance = target.to_ascii();
        let Some(node_id) = instance
            .strip_suffix(owner.as_str())
            .and_then(|prefix| prefix.strip_suffix('.'))
            .filter(|id| !id.is_empty() && !id.contains('.'))
        else {
            continue;
        };

        if record.ttl() == 0 {
            inbound.push(Inbound::Goodbye {
                service: service.to_string(),
                node_id: node_id.to_string(),
            });
            continue;
        }

        let Some((port, srv_target)) = answers.iter().find_map(|(name, rr)| match rr.data() {
            Some(RData::SRV(srv)) if *name == instance => Some((srv.port(), srv.target().to_ascii())),
            _ => None,
        }) else {
            continue;
        };

        let ip = answers.iter().find_map(|(name, rr)| match rr.data() {
            Some(RData::A(a)) if *name == srv_target => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) if *name == srv_target => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        });
        let address = match ip {
            Some(ip) => SocketAddr::new(ip, port).to_string(),
            None if srv_target == instance => continue,
            None => format!("{}:{}", srv_target.trim_end_matches('.'), port),
        };

        let chunks = answers
            .iter()
            .filter(|(name, _)| *name == instance)
            .filter_map(|(_, rr)| match rr.data() {
                Some(RData::TXT(txt)) => Some(txt.txt_data().iter()),
                _ => None,
            })
            .flatten()
            .filter_map(|data| std::str::from_utf8(data).ok().map(str::to_string))
            .collect();

        inbound.push(Inbound::Fragment(Fragment {
            service: service.to_string(),
            node_id: node_id.to_string(),
            record_id: message.id(),
            ttl_secs: record.ttl(),
            address,
            chunks,
        }));
    }
    inbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanreg_core::types::Endpoint;

    fn naming() -> Naming {
        Naming::new("lanreg")
    }

    fn announcement(address: &str) -> Announcement {
        let node = Node::new("test1-1", address).with_metadata("foo1", "bar1");
        let service = Service::new("test1", "1.0.1").with_node(node.clone());
        Announcement::new(&service, &node, &RecordCodec::default()).unwrap()
    }

    fn decode_all(packets: &[Bytes]) -> Vec<Inbound> {
        packets
            .iter()
            .flat_map(|p| parse(&decode(p).unwrap(), &naming()))
            .collect()
    }

    #[test]
    fn test_names() {
        let naming = Naming::new("lanreg.");
        assert_eq!(naming.service_type("greeter"), "_greeter._udp.lanreg.");
        assert_eq!(naming.instance("greeter", "n1"), "n1._greeter._udp.lanreg.");
        assert_eq!(naming.parse_service_type("_greeter._udp.lanreg."), Some("greeter"));
        assert_eq!(naming.parse_service_type("_greeter._udp.local."), None);
        assert_eq!(naming.parse_service_type("_._udp.lanreg."), None);
    }

    #[test]
    fn test_check_rejects_unencodable_names() {
        let service = Service::new("svc", "1").with_node(Node::new("a.b", "10.0.0.1:1"));
        assert!(matches!(
            naming().check(&service),
            Err(WireError::InvalidName { .. })
        ));

        let service = Service::new("svc", "1").with_node(Node::new("n".repeat(64), "10.0.0.1:1"));
        assert!(naming().check(&service).is_err());

        let service = Service::new("go.micro.svc", "1").with_node(Node::new("a", "10.0.0.1:1"));
        assert!(naming().check(&service).is_ok());
    }

    #[test]
    fn test_announce_round_trip_ipv4() {
        let ann = announcement("10.0.0.1:10001");
        let packets = ann.packets(&naming(), 120, 1400).unwrap();
        assert_eq!(packets.len(), 1);

        match decode_all(&packets).as_slice() {
            [Inbound::Fragment(fragment)] => {
                assert_eq!(fragment.service, "test1");
                assert_eq!(fragment.node_id, "test1-1");
                assert_eq!(fragment.address, "10.0.0.1:10001");
                assert_eq!(fragment.ttl_secs, 120);
                assert_eq!(fragment.record_id, ann.record_id);
                assert_eq!(fragment.chunks, ann.chunks);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_announce_round_trip_ipv6_and_hostname() {
        for address in ["[::]:10004", "[fe80::1]:80", "node.example:8080"] {
            let packets = announcement(address).packets(&naming(), 60, 1400).unwrap();
            match decode_all(&packets).as_slice() {
                [Inbound::Fragment(fragment)] => assert_eq!(fragment.address, address),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_large_record_splits_across_packets() {
        let node = Node::new("n1", "10.0.0.1:1");
        let mut service = Service::new("big", "1.0.0").with_node(node.clone());
        for i in 0..100 {
            service = service.with_endpoint(Endpoint::new(format!("Big.Method{}", i)));
        }
        let ann = Announcement::new(&service, &node, &RecordCodec::default()).unwrap();
        assert!(ann.chunks.len() > 4);

        let packets = ann.packets(&naming(), 120, 512).unwrap();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= 512));

        let mut chunks = Vec::new();
        for inbound in decode_all(&packets) {
            match inbound {
                Inbound::Fragment(fragment) => {
                    assert_eq!(fragment.record_id, ann.record_id);
                    chunks.extend(fragment.chunks);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(chunks, ann.chunks);
    }

    #[test]
    fn test_packet_limit_below_one_chunk() {
        let ann = announcement("10.0.0.1:10001");
        assert!(matches!(
            ann.packets(&naming(), 120, 64),
            Err(WireError::Oversized { max: 64, .. })
        ));
    }

    #[test]
    fn test_goodbye() {
        let ann = announcement("10.0.0.1:10001");
        let packet = ann.goodbye_packet(&naming(), 1400).unwrap();
        assert_eq!(
            decode_all(&[packet]),
            vec![Inbound::Goodbye {
                service: "test1".to_string(),
                node_id: "test1-1".to_string()
            }]
        );
    }

    #[test]
    fn test_queries() {
        let naming = naming();
        let all = query_message(&naming.all_services()).unwrap();
        assert_eq!(parse(&all, &naming), vec![Inbound::Query { service: None }]);

        let one = decode(&query_packet(&naming.service_type("test2")).unwrap()).unwrap();
        assert_eq!(
            parse(&one, &naming),
            vec![Inbound::Query {
                service: Some("test2".to_string())
            }]
        );

        let foreign = query_message("_http._tcp.local.").unwrap();
        assert!(parse(&foreign, &naming).is_empty());
    }

    #[test]
    fn test_other_domains_are_ignored() {
        let packets = announcement("10.0.0.1:1")
            .packets(&Naming::new("local"), 120, 1400)
            .unwrap();
        assert!(decode_all(&packets).is_empty());
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(decode(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn test_record_id_depends_on_content() {
        let a = announcement("10.0.0.1:1");
        let b = announcement("10.0.0.1:1");
        let mut c = announcement("10.0.0.1:1");
        c.chunks.push("x".to_string());
        assert_eq!(a.record_id, b.record_id);
        assert_ne!(record_id(&a.chunks), record_id(&c.chunks));
    }
}
