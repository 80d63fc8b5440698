use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind, Read, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::io::unix::AsyncFd;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_HEADER_LEN: usize = 8;
const RECV_BUF_LEN: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketKind {
    /// Needs CAP_NET_RAW. Replies carry the ip header and every icmp packet of the host.
    Raw,
    /// Unprivileged ping socket. The kernel owns the identifier and filters replies.
    Dgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IcmpKind {
    EchoReply { ident: u16, seq: u16 },
    /// Carries the identifier and sequence of the echo request that expired.
    TimeExceeded { ident: u16, seq: u16 },
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IcmpPacket {
    pub kind: IcmpKind,
    /// Sender of the packet, known only when the ip header was received.
    pub source: Option<Ipv4Addr>,
}

pub(crate) struct PingSocket {
    inner: AsyncFd<Socket>,
    kind: SocketKind,
    ident: u16,
}

impl PingSocket {
    pub(crate) fn new() -> Result<Self> {
        match Self::open(SocketKind::Raw) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!("Open raw icmp socket fail: {}, fall back to ping socket", e);
                Self::open(SocketKind::Dgram)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn open(kind: SocketKind) -> Result<Self> {
        let ty = match kind {
            SocketKind::Raw => Type::RAW,
            SocketKind::Dgram => Type::DGRAM,
        };
        let inner = Socket::new(Domain::IPV4, ty, Some(Protocol::ICMPV4))?;
        inner.set_nonblocking(true)?;
        let inner = AsyncFd::new(inner)?;
        let ident = (std::process::id() & 0xffff) as u16;
        Ok(Self { inner, kind, ident })
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn set_ttl(&self, ttl: u8) -> Result<()> {
        self.inner.get_ref().set_ttl(u32::from(ttl))
    }

    /// Identifier replies must carry, `None` when the kernel already filters them.
    pub(crate) fn ident_filter(&self) -> Option<u16> {
        match self.kind {
            SocketKind::Raw => Some(self.ident),
            SocketKind::Dgram => None,
        }
    }

    pub(crate) fn owns(&self, ident: u16) -> bool {
        self.ident_filter().map_or(true, |own| own == ident)
    }

    pub(crate) async fn send_to(&self, buf: &[u8], addr: &SockAddr) -> Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;

            match guard.try_io(|inner| inner.get_ref().send_to(buf, addr)) {
                Ok(s) => return s,
                Err(_) => continue,
            }
        }
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(s) => return s,
                Err(_) => continue,
            }
        }
    }

    pub(crate) async fn send_echo(&self, seq: u16, payload: &[u8], dst: Ipv4Addr) -> Result<()> {
        let buf = build_echo_request(self.ident, seq, payload);
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        let sent = self.send_to(&buf, &addr).await?;
        if sent != buf.len() {
            info!("Send packet len:{} less than buf len:{}", sent, buf.len());
        }
        Ok(())
    }

    /// Reads until one icmp packet can be parsed.
    pub(crate) async fn recv_packet(&self) -> Result<IcmpPacket> {
        let mut buf = vec![0_u8; RECV_BUF_LEN];
        loop {
            let len = self.read(&mut buf).await?;
            match parse_packet(&buf[..len], self.kind) {
                Some(p) => return Ok(p),
                None => debug!("Skip unparsable packet len:{}", len),
            }
        }
    }

    /// Waits up to `timeout` for a packet accepted by `matches`, skipping others.
    pub(crate) async fn recv_matching<F>(
        &self,
        timeout: Duration,
        mut matches: F,
    ) -> Result<Option<(IcmpPacket, Instant)>>
    where
        F: FnMut(&IcmpPacket) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            match time::timeout_at(deadline, self.recv_packet()).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(p)) if matches(&p) => return Ok(Some((p, Instant::now()))),
                Ok(Ok(p)) => debug!("Skip packet {:?}", p.kind),
            }
        }
    }

    /// One echo request answered by a matching echo reply, or an error.
    pub(crate) async fn ping(
        &self,
        dst: Ipv4Addr,
        seq: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Duration> {
        let send_at = Instant::now();
        self.send_echo(seq, payload, dst).await?;

        let reply = self
            .recv_matching(timeout, |p| match p.kind {
                IcmpKind::EchoReply { ident, seq: s } => s == seq && self.owns(ident),
                _ => false,
            })
            .await?;
        match reply {
            Some((_, recv_at)) => Ok(recv_at - send_at),
            None => Err(io::Error::new(
                ErrorKind::TimedOut,
                format!("no echo reply for seq {}", seq),
            )),
        }
    }
}

pub(crate) fn build_echo_request(ident: u16, seq: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ICMP_HEADER_LEN + payload.len());
    // type and code
    buf.put_u8(ICMP_ECHO_REQUEST);
    buf.put_u8(0);
    // checksum placeholder
    buf.put_u16(0);
    buf.put_u16(ident);
    buf.put_u16(seq);
    buf.put_slice(payload);

    let sum = checksum(&buf);
    buf[2..4].copy_from_slice(&sum.to_be_bytes());
    buf.freeze()
}

/// RFC 1071 internet checksum.
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0_u32;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub(crate) fn parse_packet(buf: &[u8], kind: SocketKind) -> Option<IcmpPacket> {
    let (icmp, source) = match kind {
        SocketKind::Raw => {
            let (ihl, source) = parse_ipv4_header(buf)?;
            (&buf[ihl..], Some(source))
        }
        SocketKind::Dgram => (buf, None),
    };
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }

    let kind = match icmp[0] {
        ICMP_ECHO_REPLY => {
            let (ident, seq) = read_ident_seq(icmp);
            IcmpKind::EchoReply { ident, seq }
        }
        ICMP_TIME_EXCEEDED => {
            // quoted datagram: original ip header then the first 8 bytes of our echo
            let quoted = &icmp[ICMP_HEADER_LEN..];
            let (ihl, _) = parse_ipv4_header(quoted)?;
            let inner = &quoted[ihl..];
            if inner.len() < ICMP_HEADER_LEN || inner[0] != ICMP_ECHO_REQUEST {
                return None;
            }
            let (ident, seq) = read_ident_seq(inner);
            IcmpKind::TimeExceeded { ident, seq }
        }
        other => IcmpKind::Other(other),
    };
    Some(IcmpPacket { kind, source })
}

fn parse_ipv4_header(buf: &[u8]) -> Option<(usize, Ipv4Addr)> {
    if buf.len() < 20 || buf[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(buf[0] & 0x0f) * 4;
    if ihl < 20 || buf.len() < ihl {
        return None;
    }
    let source = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    Some((ihl, source))
}

fn read_ident_seq(icmp: &[u8]) -> (u16, u16) {
    let mut fields = &icmp[4..8];
    let ident = fields.get_u16();
    let seq = fields.get_u16();
    (ident, seq)
}

pub(crate) async fn resolve_v4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((host, 0)).await?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(io::Error::new(
        ErrorKind::NotFound,
        format!("no ipv4 address for {}", host),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ipv4_header(source: Ipv4Addr, payload_len: usize) -> Vec<u8> {
        let mut h = vec![0_u8; 20];
        h[0] = 0x45;
        let total = (20 + payload_len) as u16;
        h[2..4].copy_from_slice(&total.to_be_bytes());
        h[8] = 64;
        h[9] = 1;
        h[12..16].copy_from_slice(&source.octets());
        h
    }

    pub(crate) fn echo_reply(ident: u16, seq: u16) -> Vec<u8> {
        let mut b = build_echo_request(ident, seq, b"payload").to_vec();
        b[0] = ICMP_ECHO_REPLY;
        b
    }

    #[test]
    fn echo_request_checksum_verifies() {
        let req = build_echo_request(0x1234, 7, b"HELLO-R-U-THERE");
        assert_eq!(req[0], ICMP_ECHO_REQUEST);
        assert_eq!(&req[4..6], &0x1234_u16.to_be_bytes());
        assert_eq!(&req[6..8], &7_u16.to_be_bytes());
        // summing a packet including its checksum gives zero
        assert_eq!(checksum(&req), 0);
    }

    #[test]
    fn checksum_handles_odd_length() {
        let data = [0x01, 0x02, 0x03];
        assert_eq!(checksum(&data), !(0x0102_u16 + 0x0300));
    }

    #[test]
    fn parses_raw_echo_reply() {
        let src = Ipv4Addr::new(8, 8, 8, 8);
        let icmp = echo_reply(42, 3);
        let mut pkt = ipv4_header(src, icmp.len());
        pkt.extend_from_slice(&icmp);

        let parsed = parse_packet(&pkt, SocketKind::Raw).unwrap();
        assert_eq!(parsed.kind, IcmpKind::EchoReply { ident: 42, seq: 3 });
        assert_eq!(parsed.source, Some(src));
    }

    #[test]
    fn parses_dgram_echo_reply_without_ip_header() {
        let parsed = parse_packet(&echo_reply(9, 1), SocketKind::Dgram).unwrap();
        assert_eq!(parsed.kind, IcmpKind::EchoReply { ident: 9, seq: 1 });
        assert_eq!(parsed.source, None);
    }

    #[test]
    fn parses_time_exceeded_with_quoted_echo() {
        let router = Ipv4Addr::new(10, 0, 0, 1);
        let original = build_echo_request(77, 5, b"TRACEROUTE");
        let mut quoted = ipv4_header(Ipv4Addr::new(192, 168, 1, 2), original.len());
        quoted.extend_from_slice(&original[..8]);

        let mut icmp = vec![ICMP_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&quoted);
        let mut pkt = ipv4_header(router, icmp.len());
        pkt.extend_from_slice(&icmp);

        let parsed = parse_packet(&pkt, SocketKind::Raw).unwrap();
        assert_eq!(parsed.kind, IcmpKind::TimeExceeded { ident: 77, seq: 5 });
        assert_eq!(parsed.source, Some(router));
    }

    #[test]
    fn rejects_truncated_packets() {
        assert!(parse_packet(&[0, 0, 0], SocketKind::Dgram).is_none());
        assert!(parse_packet(&[0x45, 0, 0], SocketKind::Raw).is_none());
    }

    #[tokio::test]
    async fn resolves_literal_ipv4_without_lookup() {
        let ip = resolve_v4("127.0.0.1").await.unwrap();
        assert_eq!(ip, Ipv4Addr::LOCALHOST);
    }
}
