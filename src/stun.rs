//! STUN reachability check run before a session starts.
//!
//! Sends RFC 5389 binding requests from one UDP socket to each configured server and
//! compares the mapped addresses with the local one.

use bytecodec::{DecodeExt, EncodeExt};
use rand::RngCore;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use stun_codec::rfc5389::attributes::{MappedAddress, XorMappedAddress};
use stun_codec::rfc5389::{methods::BINDING, Attribute};
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};

pub const DEFAULT_SERVERS: [&str; 2] = ["stun.l.google.com:19302", "stun1.l.google.com:19302"];
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const ATTEMPTS: usize = 3;
const MAX_DATAGRAM: usize = 1500;

#[derive(Error, Debug)]
pub enum StunError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("STUN codec error: {0}")]
    Codec(String),
    #[error("No IPv4 address for STUN server {0}")]
    Unresolved(String),
    #[error("No response from {0}")]
    NoResponse(SocketAddr),
    #[error("Response from {0} carries no mapped address")]
    NoMappedAddress(SocketAddr),
    #[error("No STUN server answered")]
    Unreachable,
}

impl From<bytecodec::Error> for StunError {
    fn from(e: bytecodec::Error) -> Self {
        StunError::Codec(e.to_string())
    }
}

pub type StunResult<T> = Result<T, StunError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// Mapped address equals the local one
    OpenInternet,
    /// Same mapping towards every server
    ConeNat,
    /// A different mapping per server
    SymmetricNat,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatType::OpenInternet => write!(f, "Open Internet"),
            NatType::ConeNat => write!(f, "Cone NAT"),
            NatType::SymmetricNat => write!(f, "Symmetric NAT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunReport {
    pub nat_type: NatType,
    pub external: SocketAddr,
}

/// Classify from the local address and the mappings reported by each server
pub fn classify(local: SocketAddr, mapped: &[SocketAddr]) -> Option<NatType> {
    let first = *mapped.first()?;
    if mapped.iter().any(|m| *m != first) {
        return Some(NatType::SymmetricNat);
    }
    if first == local {
        Some(NatType::OpenInternet)
    } else {
        Some(NatType::ConeNat)
    }
}

fn binding_request() -> Message<Attribute> {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    Message::new(MessageClass::Request, BINDING, TransactionId::new(id))
}

fn mapped_address(response: &Message<Attribute>) -> Option<SocketAddr> {
    response
        .get_attribute::<XorMappedAddress>()
        .map(|a| a.address())
        .or_else(|| response.get_attribute::<MappedAddress>().map(|a| a.address()))
}

async fn resolve_v4(server: &str) -> StunResult<SocketAddr> {
    lookup_host(server)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StunError::Unresolved(server.to_string()))
}

/// Ask `server` which address our socket appears from, retransmitting a few times
pub async fn query(socket: &UdpSocket, server: SocketAddr) -> StunResult<SocketAddr> {
    let request = binding_request();
    let bytes = MessageEncoder::new().encode_into_bytes(request.clone())?;
    let mut buf = [0u8; MAX_DATAGRAM];

    for attempt in 1..=ATTEMPTS {
        socket.send_to(&bytes, server).await?;
        let received = tokio::time::timeout(REQUEST_TIMEOUT, socket.recv_from(&mut buf)).await;
        let (len, from) = match received {
            Ok(result) => result?,
            Err(_) => {
                debug!("STUN attempt {} to {} timed out", attempt, server);
                continue;
            }
        };
        if from != server {
            debug!("Ignoring datagram from {}", from);
            continue;
        }

        let response = MessageDecoder::<Attribute>::new()
            .decode_from_bytes(&buf[..len])?
            .map_err(|broken| StunError::Codec(format!("{:?}", broken)))?;
        if response.transaction_id() != request.transaction_id()
            || response.class() != MessageClass::SuccessResponse
        {
            debug!("Ignoring unrelated STUN message from {}", from);
            continue;
        }
        return mapped_address(&response).ok_or(StunError::NoMappedAddress(server));
    }
    Err(StunError::NoResponse(server))
}

/// Query every server from one socket and classify the NAT in front of us
pub async fn perform_test(servers: &[String]) -> StunResult<StunReport> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
    let local = local_address(&socket).await;

    let mut mapped = Vec::new();
    for server in servers {
        let result = match resolve_v4(server).await {
            Ok(address) => query(&socket, address).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(address) => {
                debug!("{} sees us as {}", server, address);
                mapped.push(address);
            }
            Err(e) => warn!("STUN query to {} failed: {}", server, e),
        }
    }

    let nat_type = classify(local, &mapped).ok_or(StunError::Unreachable)?;
    Ok(StunReport {
        nat_type,
        external: mapped[0],
    })
}

/// Local address of the socket, with the wildcard replaced by the outbound interface.
///
/// Connecting a UDP socket sends nothing; it only selects the route.
async fn local_address(socket: &UdpSocket) -> SocketAddr {
    let port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
    let ip = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(route) => match route.connect("8.8.8.8:80").await {
            Ok(()) => route.local_addr().map(|a| a.ip()).ok(),
            Err(e) => {
                debug!("No outbound route: {}", e);
                None
            }
        },
        Err(e) => {
            debug!("Could not open route socket: {}", e);
            None
        }
    };
    SocketAddr::new(ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port)
}

/// Run the test and log the outcome; failures only warn
pub async fn log_test(servers: &[String]) {
    match perform_test(servers).await {
        Ok(report) => info!(
            "NAT type: {}, external address: {}, external port: {}",
            report.nat_type,
            report.external.ip(),
            report.external.port()
        ),
        Err(e) => warn!("STUN test failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify() {
        let local = addr("10.0.0.5:4000");
        assert_eq!(classify(local, &[]), None);
        assert_eq!(classify(local, &[local, local]), Some(NatType::OpenInternet));
        assert_eq!(
            classify(local, &[addr("1.2.3.4:5000"), addr("1.2.3.4:5000")]),
            Some(NatType::ConeNat)
        );
        assert_eq!(
            classify(local, &[addr("1.2.3.4:5000"), addr("1.2.3.4:5001")]),
            Some(NatType::SymmetricNat)
        );
    }

    /// Answers one binding request with the sender's address
    async fn reflector(mapped: Option<SocketAddr>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let request = MessageDecoder::<Attribute>::new()
                .decode_from_bytes(&buf[..len])
                .unwrap()
                .unwrap();
            let mut response: Message<Attribute> =
                Message::new(MessageClass::SuccessResponse, BINDING, request.transaction_id());
            let seen = mapped.unwrap_or(from);
            response.add_attribute(Attribute::XorMappedAddress(XorMappedAddress::new(seen)));
            let bytes = MessageEncoder::new().encode_into_bytes(response).unwrap();
            socket.send_to(&bytes, from).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn test_query_reads_xor_mapped_address() {
        let server = reflector(None).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mapped = query(&socket, server).await.unwrap();
        assert_eq!(mapped, socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_query_reports_external_mapping() {
        let external = addr("203.0.113.7:40000");
        let server = reflector(Some(external)).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert_eq!(query(&socket, server).await.unwrap(), external);
    }

    #[tokio::test]
    async fn test_silent_server_is_no_response() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = silent.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert!(matches!(
            query(&socket, server).await,
            Err(StunError::NoResponse(a)) if a == server
        ));
    }
}
