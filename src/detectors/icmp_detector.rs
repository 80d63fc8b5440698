use super::ping_socket::{resolve_v4, IcmpKind, IcmpPacket, PingSocket};
use super::{ProbeError, TestType};
use crate::conf::Icmp;
use crate::structures::IcmpResult;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

const PAYLOAD: &[u8] = b"HELLO-R-U-THERE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Echo(Instant),
    /// Any other icmp message quoting our sequence, e.g. time exceeded.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EchoOutcome {
    Received(Duration),
    Lost(String),
}

/// Per-sequence completion slots filled by the single socket reader.
pub(crate) struct ReplySlots {
    ident: Option<u16>,
    pending: Mutex<HashMap<u16, oneshot::Sender<Reply>>>,
}

impl ReplySlots {
    pub(crate) fn new(ident: Option<u16>) -> Self {
        Self {
            ident,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn register(&self, seq: u16) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);
        rx
    }

    pub(crate) async fn cancel(&self, seq: u16) {
        self.pending.lock().await.remove(&seq);
    }

    /// Hands the packet to the worker waiting on its sequence. Returns whether one was waiting.
    pub(crate) async fn deliver(&self, packet: &IcmpPacket, at: Instant) -> bool {
        let (ident, seq, reply) = match packet.kind {
            IcmpKind::EchoReply { ident, seq } => (ident, seq, Reply::Echo(at)),
            IcmpKind::TimeExceeded { ident, seq } => (ident, seq, Reply::Other),
            IcmpKind::Other(_) => return false,
        };
        if self.ident.map_or(false, |own| own != ident) {
            return false;
        }

        let slot = self.pending.lock().await.remove(&seq);
        match slot {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!("Recv reply for unknown seq:{}", seq);
                false
            }
        }
    }
}

pub struct IcmpDetector {
    conf: Icmp,
}

impl IcmpDetector {
    pub fn new(conf: Icmp) -> Self {
        Self { conf }
    }

    #[tracing::instrument(skip(self), fields(target = %self.conf.target))]
    pub async fn detect(&self) -> Result<IcmpResult, ProbeError> {
        let dst = resolve_v4(&self.conf.target)
            .await
            .map_err(|e| ProbeError::setup(TestType::Icmp, format!("resolve target: {}", e)))?;
        let sock = PingSocket::new()
            .map_err(|e| ProbeError::setup(TestType::Icmp, format!("open icmp socket: {}", e)))?;

        Ok(self.detect_with(Arc::new(sock), dst).await)
    }

    async fn detect_with(&self, sock: Arc<PingSocket>, dst: Ipv4Addr) -> IcmpResult {
        let count = self.conf.packet_count;
        let timeout = self.conf.timeout();
        let slots = Arc::new(ReplySlots::new(sock.ident_filter()));

        let reader = tokio::spawn(Self::read_replies(sock.clone(), slots.clone()));

        let (outcome_tx, mut outcome_rx) = mpsc::channel(usize::from(count).max(1));
        let mut handlers = Vec::with_capacity(usize::from(count));
        for seq in 0..count {
            let sock = sock.clone();
            let slots = slots.clone();
            let outcome_tx = outcome_tx.clone();
            handlers.push(tokio::spawn(async move {
                let outcome = Self::echo(&sock, &slots, dst, seq, timeout).await;
                if outcome_tx.send(outcome).await.is_err() {
                    warn!("Outcome rx closed before seq:{} reported", seq);
                }
            }));
        }
        drop(outcome_tx);

        join_all(handlers).await;
        reader.abort();

        let mut outcomes = Vec::with_capacity(usize::from(count));
        while let Some(o) = outcome_rx.recv().await {
            outcomes.push(o);
        }

        let result = tally(dst.to_string(), u32::from(count), outcomes);
        info!(
            "Icmp test done sent:{} received:{} lost:{} avg_rtt:{:?}",
            result.sent, result.received, result.lost, result.avg_rtt
        );
        result
    }

    async fn read_replies(sock: Arc<PingSocket>, slots: Arc<ReplySlots>) {
        loop {
            match sock.recv_packet().await {
                Ok(packet) => {
                    slots.deliver(&packet, Instant::now()).await;
                }
                Err(e) => {
                    warn!("Icmp socket read fail, stop reader: {}", e);
                    return;
                }
            }
        }
    }

    async fn echo(
        sock: &PingSocket,
        slots: &ReplySlots,
        dst: Ipv4Addr,
        seq: u16,
        timeout: Duration,
    ) -> EchoOutcome {
        let rx = slots.register(seq).await;
        let send_at = Instant::now();
        if let Err(e) = sock.send_echo(seq, PAYLOAD, dst).await {
            slots.cancel(seq).await;
            return EchoOutcome::Lost(format!("send seq {}: {}", seq, e));
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(Reply::Echo(recv_at))) => EchoOutcome::Received(recv_at - send_at),
            Ok(Ok(Reply::Other)) => EchoOutcome::Lost(format!("non echo reply for seq {}", seq)),
            Ok(Err(_)) => EchoOutcome::Lost(format!("reply slot of seq {} dropped", seq)),
            Err(_) => {
                slots.cancel(seq).await;
                EchoOutcome::Lost(format!("seq {} timed out", seq))
            }
        }
    }
}

pub(crate) fn tally(host: String, sent: u32, outcomes: Vec<EchoOutcome>) -> IcmpResult {
    let mut result = IcmpResult::new(host, sent);
    let mut total = Duration::ZERO;

    for outcome in outcomes {
        match outcome {
            EchoOutcome::Received(rtt) => {
                result.received += 1;
                if result.received == 1 || rtt < result.min_rtt {
                    result.min_rtt = rtt;
                }
                if rtt > result.max_rtt {
                    result.max_rtt = rtt;
                }
                total += rtt;
            }
            EchoOutcome::Lost(reason) => {
                debug!("Echo lost: {}", reason);
                result.lost += 1;
            }
        }
    }

    if result.received > 0 {
        result.avg_rtt = total / result.received;
    }
    result
}
