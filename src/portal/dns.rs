//! Captive DNS responder.
//!
//! Every query is answered with a single A record pointing at the
//! hotspot's own address, which is what makes client devices open the
//! provisioning page.
//!
//! # Response Format
//!
//! ```text
//! header   id (copied) | flags 0x8180 | qd=1 | an=1 | ns=0 | ar=0
//! question first question of the query, copied verbatim
//! answer   name=0xC00C (pointer to offset 12) | type A | class IN | ttl 60 | rdlen 4 | ip
//! ```

use super::{DnsService, PortalError, ServiceFuture};
use crate::config::parse_ipv4;
use log::{debug, info, warn};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default listen address for the responder.
pub const DEFAULT_DNS_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 53));

/// DNS header length; shorter packets are dropped.
pub const DNS_HEADER_LEN: usize = 12;

/// TTL of the answer record, in seconds.
pub const ANSWER_TTL: u32 = 60;

/// Receive buffer size.
const MAX_PACKET_LEN: usize = 1024;

/// Pause after a socket error before receiving again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

const FLAGS_RESPONSE: [u8; 2] = [0x81, 0x80];
const QR_BIT: u8 = 0x80;
const TYPE_A: [u8; 2] = [0x00, 0x01];
const CLASS_IN: [u8; 2] = [0x00, 0x01];
const NAME_POINTER: [u8; 2] = [0xC0, 0x0C];

/// Turns a received datagram into an optional reply.
pub trait PacketHandler: Send + Sync {
    /// Reply to `packet`, or `None` to drop it.
    fn handle(&self, packet: &[u8]) -> Option<Vec<u8>>;
}

/// Answers every query with a fixed IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptiveDns {
    ip: Ipv4Addr,
}

impl CaptiveDns {
    /// Answer with `ip`.
    pub fn new(ip: Ipv4Addr) -> Self {
        Self { ip }
    }

    /// Answer with a dotted-quad address, validated first.
    pub fn parse(ip: &str) -> Result<Self, PortalError> {
        parse_ipv4(ip)
            .map(Self::new)
            .map_err(|_| PortalError::InvalidIp(ip.to_string()))
    }

    /// Address given in every answer.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }
}

/// End offset of the first question, or `None` if it is truncated.
fn first_question_end(packet: &[u8]) -> Option<usize> {
    let mut pos = DNS_HEADER_LEN;
    loop {
        let len = usize::from(*packet.get(pos)?);
        if len == 0 {
            pos += 1;
            break;
        }
        // Compression pointers and extended labels never appear in a
        // well-formed first question.
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len;
    }
    // QTYPE + QCLASS
    let end = pos + 4;
    (end <= packet.len()).then_some(end)
}

impl PacketHandler for CaptiveDns {
    fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        if query.len() < DNS_HEADER_LEN {
            return None;
        }
        if query[2] & QR_BIT != 0 {
            return None;
        }
        let qdcount = u16::from_be_bytes([query[4], query[5]]);
        if qdcount == 0 {
            return None;
        }
        let question_end = first_question_end(query)?;

        let mut response = Vec::with_capacity(question_end + 16);
        response.extend_from_slice(&query[0..2]);
        response.extend_from_slice(&FLAGS_RESPONSE);
        response.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        response.extend_from_slice(&1u16.to_be_bytes()); // ancount
        response.extend_from_slice(&0u16.to_be_bytes()); // nscount
        response.extend_from_slice(&0u16.to_be_bytes()); // arcount
        response.extend_from_slice(&query[DNS_HEADER_LEN..question_end]);

        response.extend_from_slice(&NAME_POINTER);
        response.extend_from_slice(&TYPE_A);
        response.extend_from_slice(&CLASS_IN);
        response.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&self.ip.octets());
        Some(response)
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// UDP responder running as a tokio task.
///
/// Must be started from within a tokio runtime.
pub struct DnsResponder {
    bind_addr: SocketAddr,
    running: Option<Running>,
}

impl DnsResponder {
    /// Responder that will listen on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            running: None,
        }
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Start serving with an arbitrary packet handler.
    ///
    /// A running instance is stopped and its socket released first.
    pub async fn start_with(&mut self, handler: Arc<dyn PacketHandler>) -> Result<(), PortalError> {
        self.shutdown().await;

        let addr = self.bind_addr;
        let std_socket = std::net::UdpSocket::bind(addr)
            .map_err(|source| PortalError::Bind { addr, source })?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(serve(socket, handler, cancel.clone()));

        info!("DNS responder listening on {}", local_addr);
        self.running = Some(Running {
            cancel,
            handle,
            local_addr,
        });
        Ok(())
    }

    /// Cancel the serve task and wait for it, which drops its socket.
    async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!("DNS task ended abnormally: {}", e);
            }
            info!("DNS responder stopped");
        }
    }
}

impl Default for DnsResponder {
    fn default() -> Self {
        Self::new(DEFAULT_DNS_ADDR)
    }
}

impl DnsService for DnsResponder {
    fn start(&mut self, ip: Ipv4Addr) -> ServiceFuture<'_, Result<(), PortalError>> {
        Box::pin(async move {
            info!("DNS responder redirecting to {}", ip);
            self.start_with(Arc::new(CaptiveDns::new(ip))).await
        })
    }

    fn stop(&mut self) -> ServiceFuture<'_, ()> {
        Box::pin(self.shutdown())
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for DnsResponder {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.handle.abort();
        }
    }
}

async fn serve(socket: UdpSocket, handler: Arc<dyn PacketHandler>, cancel: CancellationToken) {
    let mut buf = [0u8; MAX_PACKET_LEN];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, peer)) => match handler.handle(&buf[..len]) {
                    Some(response) => {
                        if let Err(e) = socket.send_to(&response, peer).await {
                            warn!("DNS send to {} failed: {}", peer, e);
                        }
                    }
                    None => debug!("Dropped {}-byte DNS packet from {}", len, peer),
                },
                Err(e) => {
                    warn!("DNS receive error: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    /// Standard query for `name` (type A, class IN), with RD set.
    fn query(id: u16, name: &str) -> Vec<u8> {
        let mut q = Vec::new();
        q.extend_from_slice(&id.to_be_bytes());
        q.extend_from_slice(&[0x01, 0x00]); // RD
        q.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        for label in name.split('.') {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&TYPE_A);
        q.extend_from_slice(&CLASS_IN);
        q
    }

    // ===== Packet handling =====

    #[test]
    fn test_short_packet_dropped() {
        let dns = CaptiveDns::new(AP_IP);
        assert!(dns.handle(&[0u8; 11]).is_none());
        assert!(dns.handle(&[]).is_none());
    }

    #[test]
    fn test_answer_layout() {
        let dns = CaptiveDns::new(AP_IP);
        let q = query(0xBEEF, "connectivitycheck.gstatic.com");
        let r = dns.handle(&q).unwrap();

        // Header
        assert_eq!(&r[0..2], &[0xBE, 0xEF]);
        assert_eq!(&r[2..4], &[0x81, 0x80]);
        assert_eq!(&r[4..6], &[0, 1]);
        assert_eq!(&r[6..8], &[0, 1]);
        assert_eq!(&r[8..12], &[0, 0, 0, 0]);

        // Question echoed
        assert_eq!(&r[12..q.len()], &q[12..]);

        // Answer
        let a = &r[q.len()..];
        assert_eq!(&a[0..2], &[0xC0, 0x0C]);
        assert_eq!(&a[2..4], &[0, 1]);
        assert_eq!(&a[4..6], &[0, 1]);
        assert_eq!(&a[6..10], &60u32.to_be_bytes());
        assert_eq!(&a[10..12], &[0, 4]);
        assert_eq!(&a[12..16], &[192, 168, 4, 1]);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_trailing_records_not_echoed() {
        let dns = CaptiveDns::new(AP_IP);
        let mut q = query(7, "example.com");
        let question_len = q.len();
        // Pretend there is an EDNS OPT record
        q[11] = 1;
        q.extend_from_slice(&[0, 0, 41, 0x10, 0, 0, 0, 0, 0, 0, 0]);

        let r = dns.handle(&q).unwrap();
        assert_eq!(&r[10..12], &[0, 0]);
        assert_eq!(r.len(), question_len + 16);
    }

    #[test]
    fn test_response_packet_dropped() {
        let dns = CaptiveDns::new(AP_IP);
        let mut q = query(1, "example.com");
        q[2] |= 0x80;
        assert!(dns.handle(&q).is_none());
    }

    #[test]
    fn test_no_question_dropped() {
        let dns = CaptiveDns::new(AP_IP);
        let mut header = vec![0u8; 12];
        header[2] = 0x01;
        assert!(dns.handle(&header).is_none());
    }

    #[test]
    fn test_truncated_question_dropped() {
        let dns = CaptiveDns::new(AP_IP);
        let q = query(1, "example.com");
        // Cut inside QTYPE
        assert!(dns.handle(&q[..q.len() - 3]).is_none());
        // Cut inside the name
        assert!(dns.handle(&q[..16]).is_none());
    }

    #[test]
    fn test_ip_validation() {
        assert_eq!(CaptiveDns::parse("10.0.0.1").unwrap().ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(matches!(
            CaptiveDns::parse("192.168.4"),
            Err(PortalError::InvalidIp(_))
        ));
        assert!(CaptiveDns::parse("300.1.1.1").is_err());
    }

    // ===== Socket =====

    async fn recv_reply(client: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for DNS reply")
            .unwrap();
        buf[..len].to_vec()
    }

    /// A loopback address that was free a moment ago.
    fn fixed_addr() -> SocketAddr {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    async fn ask(server: SocketAddr, id: u16) -> Vec<u8> {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(id, "example.com"), server).await.unwrap();
        recv_reply(&client).await
    }

    #[tokio::test]
    async fn test_responder_answers_over_udp() {
        let mut responder = DnsResponder::new("127.0.0.1:0".parse().unwrap());
        responder.start(AP_IP).await.unwrap();
        assert!(responder.is_running());
        let server = responder.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Short packet gets no reply; the following query does
        client.send_to(&[0u8; 11], server).await.unwrap();
        client.send_to(&query(42, "example.com"), server).await.unwrap();

        let reply = recv_reply(&client).await;
        assert_eq!(&reply[0..2], &42u16.to_be_bytes());
        assert_eq!(&reply[reply.len() - 4..], &[192, 168, 4, 1]);

        responder.stop().await;
        assert!(!responder.is_running());
        assert!(responder.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_restart_rebinds_same_address() {
        let addr = fixed_addr();
        let mut responder = DnsResponder::new(addr);

        responder.start(AP_IP).await.unwrap();
        // Restart while running reuses the port
        responder.start(Ipv4Addr::new(10, 1, 2, 3)).await.unwrap();
        assert_eq!(responder.local_addr(), Some(addr));
        let reply = ask(addr, 9).await;
        assert_eq!(&reply[reply.len() - 4..], &[10, 1, 2, 3]);

        // So does a start right after an explicit stop
        responder.stop().await;
        responder.start(AP_IP).await.unwrap();
        let reply = ask(addr, 10).await;
        assert_eq!(&reply[reply.len() - 4..], &[192, 168, 4, 1]);

        // And a second responder once the first has stopped
        responder.stop().await;
        let mut other = DnsResponder::new(addr);
        other.start(AP_IP).await.unwrap();
        assert!(other.is_running());
    }
}
