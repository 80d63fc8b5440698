use crate::util::{duration_nanos, duration_nanos_vec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Result of one probe run, tagged by the test type that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test_type", rename_all = "lowercase")]
pub enum ProbeResult {
    Icmp(IcmpResult),
    Tcp(TcpResult),
    Route(RouteResult),
    Jitter(JitterResult),
    Latency(LatencyResult),
    Download(ThroughputResult),
    Upload(ThroughputResult),
    Bandwidth(BandwidthResult),
}

impl ProbeResult {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ProbeResult::Icmp(r) => r.timestamp,
            ProbeResult::Tcp(r) => r.timestamp,
            ProbeResult::Route(r) => r.timestamp,
            ProbeResult::Jitter(r) => r.timestamp,
            ProbeResult::Latency(r) => r.timestamp,
            ProbeResult::Download(r) | ProbeResult::Upload(r) => r.timestamp,
            ProbeResult::Bandwidth(r) => r.start_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcmpResult {
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub sent: u32,
    pub received: u32,
    pub lost: u32,
    #[serde(with = "duration_nanos")]
    pub min_rtt: Duration,
    #[serde(with = "duration_nanos")]
    pub max_rtt: Duration,
    #[serde(with = "duration_nanos")]
    pub avg_rtt: Duration,
}

impl IcmpResult {
    pub fn new(host: String, sent: u32) -> Self {
        Self {
            host,
            timestamp: Utc::now(),
            sent,
            received: 0,
            lost: 0,
            min_rtt: Duration::ZERO,
            max_rtt: Duration::ZERO,
            avg_rtt: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// The ttl the probe was sent with, starting at 1.
    pub number: u8,
    /// Empty when the hop did not answer.
    pub address: String,
    #[serde(with = "duration_nanos")]
    pub rtt: Duration,
    pub lost: bool,
}

impl Hop {
    pub fn lost(number: u8) -> Self {
        Self {
            number,
            address: String::new(),
            rtt: Duration::ZERO,
            lost: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteStatus {
    Success,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub hops: Vec<Hop>,
    pub status: RouteStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SampleStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterResult {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub packet_count: u16,
    #[serde(with = "duration_nanos")]
    pub avg_jitter: Duration,
    #[serde(with = "duration_nanos")]
    pub max_jitter: Duration,
    #[serde(with = "duration_nanos")]
    pub min_jitter: Duration,
    /// Percentage of lost samples.
    pub packet_loss: f64,
    #[serde(with = "duration_nanos_vec")]
    pub rtts: Vec<Duration>,
    pub status: SampleStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyResult {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub packet_count: u16,
    #[serde(with = "duration_nanos")]
    pub avg_latency: Duration,
    #[serde(with = "duration_nanos")]
    pub max_latency: Duration,
    #[serde(with = "duration_nanos")]
    pub min_latency: Duration,
    pub packet_loss: f64,
    #[serde(with = "duration_nanos_vec")]
    pub rtts: Vec<Duration>,
    pub status: SampleStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortResult {
    pub port: u16,
    pub connected: bool,
    #[serde(with = "duration_nanos")]
    pub connect_time: Duration,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpResult {
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub port_results: Vec<PortResult>,
    pub successful_ports: u32,
    pub failed_ports: u32,
    #[serde(with = "duration_nanos")]
    pub min_connect_time: Duration,
    #[serde(with = "duration_nanos")]
    pub max_connect_time: Duration,
    #[serde(with = "duration_nanos")]
    pub average_connect_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub speed: f64,
    pub status: String,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub bytes: u64,
}

impl SpeedSample {
    pub fn failed(status: impl Into<String>) -> Self {
        Self {
            speed: 0.0,
            status: status.into(),
            duration: Duration::ZERO,
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputResult {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub status: String,
    pub average_mbps: f64,
    #[serde(with = "duration_nanos")]
    pub elapsed_time: Duration,
    pub bytes_received: u64,
    pub tested_urls: BTreeMap<String, SpeedSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResult {
    pub id: u32,
    pub bytes_recv: u64,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// Mbps of this connection alone.
    pub speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStep {
    pub connections: u32,
    pub conn_results: Vec<ConnectionResult>,
    pub total_bytes: u64,
    pub avg_speed: f64,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// No connection of the step moved any data.
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub steps: Vec<ConnectionStep>,
    pub optimal_conns: u32,
    pub max_throughput: f64,
    /// Zero when the threshold was never crossed.
    pub failure_point: u32,
    pub total_data: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_result_json_keeps_tag_and_durations() {
        let mut icmp = IcmpResult::new(String::from("8.8.8.8"), 4);
        icmp.received = 4;
        icmp.min_rtt = Duration::from_micros(10_500);
        icmp.max_rtt = Duration::from_micros(20_250);
        icmp.avg_rtt = Duration::from_nanos(15_000_123);
        let result = ProbeResult::Icmp(icmp);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["test_type"], "icmp");
        assert_eq!(json["avg_rtt"], 15_000_123);

        let back: ProbeResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn route_status_is_uppercase() {
        let route = RouteResult {
            timestamp: Utc::now(),
            target: String::from("1.1.1.1"),
            hops: vec![Hop::lost(1)],
            status: RouteStatus::Incomplete,
        };
        let json = serde_json::to_string(&ProbeResult::Route(route)).unwrap();
        assert!(json.contains("\"status\":\"INCOMPLETE\""));
        assert!(json.contains("\"test_type\":\"route\""));
    }

    #[test]
    fn bandwidth_result_round_trips_nested_steps() {
        let step = ConnectionStep {
            connections: 2,
            conn_results: vec![
                ConnectionResult {
                    id: 0,
                    bytes_recv: 100,
                    duration: Duration::from_millis(5),
                    speed: 0.16,
                    error: None,
                },
                ConnectionResult {
                    id: 1,
                    bytes_recv: 0,
                    duration: Duration::from_millis(1),
                    speed: 0.0,
                    error: Some(String::from("connection reset")),
                },
            ],
            total_bytes: 100,
            avg_speed: 0.15,
            duration: Duration::from_millis(6),
            failed: false,
        };
        let result = ProbeResult::Bandwidth(BandwidthResult {
            start_time: Utc::now(),
            end_time: Utc::now(),
            steps: vec![step],
            optimal_conns: 2,
            max_throughput: 0.15,
            failure_point: 0,
            total_data: 100,
        });

        let json = serde_json::to_string(&result).unwrap();
        let back: ProbeResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
