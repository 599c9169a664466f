//! Direct DNS queries to a single server, with a deadline.
//!
//! Health checks must reach the local sinkhole itself, not whatever the
//! system resolver points at (systemd-resolved's stub on many hosts), so
//! the query is built by hand and sent over UDP to the given address.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::ProbeError;

pub const DNS_PORT: u16 = 53;

/// Maximum DNS message size over UDP.
const MAX_UDP_DNS_SIZE: usize = 512;

/// Ask `server` for the A records of `host`, giving up after `timeout`.
///
/// NXDOMAIN and empty answers are `NoAnswer`; socket errors (nothing
/// listening, unreachable) are `Network`.
pub async fn query_host(server: SocketAddr, host: &str, timeout: Duration) -> Result<Vec<IpAddr>, ProbeError> {
    match tokio::time::timeout(timeout, exchange(server, host)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout.as_secs())),
    }
}

async fn exchange(server: SocketAddr, host: &str) -> Result<Vec<IpAddr>, ProbeError> {
    let name = Name::from_ascii(host).map_err(|e| ProbeError::NoAnswer(format!("{} ({})", host, e)))?;
    let id = query_id();

    let mut query = Message::new();
    query
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    let bytes = query.to_bytes().map_err(network)?;

    let bind: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await.map_err(network)?;
    socket.connect(server).await.map_err(network)?;
    socket.send(&bytes).await.map_err(network)?;

    let mut buf = [0u8; MAX_UDP_DNS_SIZE];
    loop {
        let len = socket.recv(&mut buf).await.map_err(network)?;
        let response = Message::from_bytes(&buf[..len]).map_err(network)?;
        if response.id() != id {
            debug!("Dropping DNS answer with stale id {}", response.id());
            continue;
        }
        return addresses(host, &response);
    }
}

fn addresses(host: &str, response: &Message) -> Result<Vec<IpAddr>, ProbeError> {
    if response.response_code() != ResponseCode::NoError {
        debug!("Resolver answered {} for {}", response.response_code(), host);
        return Err(ProbeError::NoAnswer(host.to_string()));
    }
    let addrs: Vec<IpAddr> = response
        .answers()
        .iter()
        .filter_map(|record| record.data().and_then(|data| data.ip_addr()))
        .collect();
    if addrs.is_empty() {
        Err(ProbeError::NoAnswer(host.to_string()))
    } else {
        Ok(addrs)
    }
}

/// Not a security boundary: the socket is connected to one server and
/// only needs to tell a late answer from the current one.
fn query_id() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos ^ std::process::id()) as u16
}

fn network(err: impl std::fmt::Display) -> ProbeError {
    ProbeError::Network(err.to_string())
}
