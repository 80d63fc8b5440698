use super::ping_socket::{resolve_v4, IcmpKind, IcmpPacket, PingSocket, SocketKind};
use super::{ProbeError, TestType};
use crate::conf::Route;
use crate::structures::{Hop, RouteResult, RouteStatus};
use chrono::Utc;
use std::net::Ipv4Addr;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PAYLOAD: &[u8] = b"TRACEROUTE";

pub struct RouteDetector {
    conf: Route,
    timeout: Duration,
}

impl RouteDetector {
    pub fn new(conf: Route, timeout: Duration) -> Self {
        Self { conf, timeout }
    }

    #[tracing::instrument(skip(self), fields(target = %self.conf.target))]
    pub async fn detect(&self) -> Result<RouteResult, ProbeError> {
        let dst = resolve_v4(&self.conf.target)
            .await
            .map_err(|e| ProbeError::setup(TestType::Route, format!("resolve target: {}", e)))?;
        let sock = PingSocket::new()
            .map_err(|e| ProbeError::setup(TestType::Route, format!("open icmp socket: {}", e)))?;
        if sock.kind() == SocketKind::Dgram {
            warn!("Ping socket does not receive time exceeded, intermediate hops will be lost");
        }

        let mut result = RouteResult {
            timestamp: Utc::now(),
            target: self.conf.target.clone(),
            hops: Vec::with_capacity(usize::from(self.conf.max_hops)),
            status: RouteStatus::Incomplete,
        };

        for ttl in 1..=self.conf.max_hops {
            let hop = self.probe_hop(&sock, dst, ttl).await;
            debug!("Hop {} address:{} lost:{}", hop.number, hop.address, hop.lost);
            if push_hop(&mut result, hop, dst) {
                info!("Route to {} complete in {} hops", dst, ttl);
                return Ok(result);
            }
        }

        info!("Route to {} incomplete after {} hops", dst, self.conf.max_hops);
        Ok(result)
    }

    async fn probe_hop(&self, sock: &PingSocket, dst: Ipv4Addr, ttl: u8) -> Hop {
        let seq = u16::from(ttl);
        if let Err(e) = sock.set_ttl(ttl) {
            warn!("Set ttl {} fail: {}", ttl, e);
            return Hop::lost(ttl);
        }

        let send_at = Instant::now();
        if let Err(e) = sock.send_echo(seq, PAYLOAD, dst).await {
            debug!("Send hop {} fail: {}", ttl, e);
            return Hop::lost(ttl);
        }

        let reply = sock
            .recv_matching(self.timeout, |p| reply_seq(sock, p) == Some(seq))
            .await;
        match reply {
            Ok(Some((packet, recv_at))) => hop_from_reply(ttl, &packet, dst, recv_at - send_at),
            Ok(None) => Hop::lost(ttl),
            Err(e) => {
                debug!("Recv hop {} fail: {}", ttl, e);
                Hop::lost(ttl)
            }
        }
    }
}

fn reply_seq(sock: &PingSocket, packet: &IcmpPacket) -> Option<u16> {
    match packet.kind {
        IcmpKind::EchoReply { ident, seq } | IcmpKind::TimeExceeded { ident, seq }
            if sock.owns(ident) =>
        {
            Some(seq)
        }
        _ => None,
    }
}

pub(crate) fn hop_from_reply(ttl: u8, packet: &IcmpPacket, dst: Ipv4Addr, rtt: Duration) -> Hop {
    let address = match packet.kind {
        IcmpKind::EchoReply { .. } => dst,
        IcmpKind::TimeExceeded { .. } => match packet.source {
            Some(source) => source,
            None => return Hop::lost(ttl),
        },
        IcmpKind::Other(_) => return Hop::lost(ttl),
    };
    Hop {
        number: ttl,
        address: address.to_string(),
        rtt,
        lost: false,
    }
}

/// Appends the hop and reports whether it reached the target.
pub(crate) fn push_hop(result: &mut RouteResult, hop: Hop, dst: Ipv4Addr) -> bool {
    let reached = !hop.lost && hop.address == dst.to_string();
    result.hops.push(hop);
    if reached {
        result.status = RouteStatus::Success;
    }
    reached
}
