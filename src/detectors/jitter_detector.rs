use super::ping_socket::{resolve_v4, PingSocket};
use super::{ProbeError, TestType};
use crate::conf::Sampling;
use crate::structures::{JitterResult, LatencyResult, ProbeResult, SampleStatus};
use chrono::Utc;
use std::net::Ipv4Addr;
use tokio::time::{self, Duration};
use tracing::{debug, info};

const PACING: Duration = Duration::from_millis(50);

/// Reduction of a run of sequential echo samples, `None` marking a lost one.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct SampleSummary {
    pub rtts: Vec<Duration>,
    pub deltas: Vec<Duration>,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    pub packet_loss: f64,
}

pub(crate) fn summarize(samples: &[Option<Duration>]) -> SampleSummary {
    let mut summary = SampleSummary::default();
    let mut total = Duration::ZERO;
    let mut lost = 0_usize;

    for sample in samples {
        let rtt = match sample {
            Some(rtt) => *rtt,
            None => {
                lost += 1;
                continue;
            }
        };

        if let Some(last) = summary.rtts.last() {
            let delta = if rtt > *last { rtt - *last } else { *last - rtt };
            if summary.deltas.is_empty() || delta < summary.min {
                summary.min = delta;
            }
            if delta > summary.max {
                summary.max = delta;
            }
            total += delta;
            summary.deltas.push(delta);
        }
        summary.rtts.push(rtt);
    }

    if !samples.is_empty() {
        summary.packet_loss = lost as f64 / samples.len() as f64 * 100.0;
    }
    if !summary.deltas.is_empty() {
        summary.avg = total / summary.deltas.len() as u32;
    }
    summary
}

/// Sends spaced echo requests one at a time.
pub struct JitterDetector {
    conf: Sampling,
    timeout: Duration,
}

impl JitterDetector {
    pub fn new(conf: Sampling, timeout: Duration) -> Self {
        Self { conf, timeout }
    }

    async fn sample(&self, test: TestType, payload: &[u8]) -> Result<SampleSummary, ProbeError> {
        let dst = resolve_v4(&self.conf.target)
            .await
            .map_err(|e| ProbeError::setup(test, format!("resolve target: {}", e)))?;
        let sock = PingSocket::new()
            .map_err(|e| ProbeError::setup(test, format!("open icmp socket: {}", e)))?;

        let samples = self.collect(&sock, dst, payload).await;
        Ok(summarize(&samples))
    }

    async fn collect(
        &self,
        sock: &PingSocket,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> Vec<Option<Duration>> {
        let count = self.conf.packet_count;
        let mut samples = Vec::with_capacity(usize::from(count));
        for seq in 0..count {
            match sock.ping(dst, seq, payload, self.timeout).await {
                Ok(rtt) => samples.push(Some(rtt)),
                Err(e) => {
                    debug!("Sample seq:{} lost: {}", seq, e);
                    samples.push(None);
                }
            }
            if seq + 1 < count {
                time::sleep(PACING).await;
            }
        }
        samples
    }

    #[tracing::instrument(skip(self), fields(target = %self.conf.target))]
    pub async fn detect_jitter(&self) -> Result<JitterResult, ProbeError> {
        let timestamp = Utc::now();
        let s = self.sample(TestType::Jitter, b"JITTER").await?;
        let status = status_of(&s);
        let result = JitterResult {
            timestamp,
            target: self.conf.target.clone(),
            packet_count: self.conf.packet_count,
            avg_jitter: s.avg,
            max_jitter: s.max,
            min_jitter: s.min,
            packet_loss: s.packet_loss,
            rtts: s.rtts,
            status,
        };

        if status == SampleStatus::Failed {
            return Err(ProbeError::with_partial(
                TestType::Jitter,
                "all packets lost",
                ProbeResult::Jitter(result),
            ));
        }
        info!(
            "Jitter test done avg:{:?} loss:{:.1}%",
            result.avg_jitter, result.packet_loss
        );
        Ok(result)
    }

    #[tracing::instrument(skip(self), fields(target = %self.conf.target))]
    pub async fn detect_latency(&self) -> Result<LatencyResult, ProbeError> {
        let timestamp = Utc::now();
        let s = self.sample(TestType::Latency, b"Latency").await?;
        let status = status_of(&s);
        let result = LatencyResult {
            timestamp,
            target: self.conf.target.clone(),
            packet_count: self.conf.packet_count,
            avg_latency: s.avg,
            max_latency: s.max,
            min_latency: s.min,
            packet_loss: s.packet_loss,
            rtts: s.rtts,
            status,
        };

        if status == SampleStatus::Failed {
            return Err(ProbeError::with_partial(
                TestType::Latency,
                "all packets lost",
                ProbeResult::Latency(result),
            ));
        }
        info!(
            "Latency test done avg:{:?} loss:{:.1}%",
            result.avg_latency, result.packet_loss
        );
        Ok(result)
    }
}

fn status_of(summary: &SampleSummary) -> SampleStatus {
    if summary.rtts.is_empty() {
        SampleStatus::Failed
    } else {
        SampleStatus::Success
    }
}
