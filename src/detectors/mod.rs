mod bandwidth_detector;
mod http;
mod icmp_detector;
mod jitter_detector;
mod ping_socket;
mod route_detector;
mod tcp_ping_detector;
mod throughput_detector;

pub use bandwidth_detector::BandwidthDetector;
pub use icmp_detector::IcmpDetector;
pub use jitter_detector::JitterDetector;
pub use route_detector::RouteDetector;
pub use tcp_ping_detector::TcpPingDetector;
pub use throughput_detector::ThroughputDetector;

use crate::conf::Conf;
use crate::structures::ProbeResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Icmp,
    Tcp,
    Route,
    Jitter,
    Latency,
    Download,
    Upload,
    Bandwidth,
}

impl TestType {
    pub const ALL: [TestType; 8] = [
        TestType::Icmp,
        TestType::Tcp,
        TestType::Route,
        TestType::Jitter,
        TestType::Latency,
        TestType::Download,
        TestType::Upload,
        TestType::Bandwidth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Icmp => "icmp",
            TestType::Tcp => "tcp",
            TestType::Route => "route",
            TestType::Jitter => "jitter",
            TestType::Latency => "latency",
            TestType::Download => "download",
            TestType::Upload => "upload",
            TestType::Bandwidth => "bandwidth",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| ProbeError::Unsupported(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unsupported test type: {0}")]
    Unsupported(String),

    /// The probe could not produce a usable result. `partial` holds whatever was
    /// measured before giving up.
    #[error("{test} test failed: {reason}")]
    Failed {
        test: TestType,
        reason: String,
        partial: Option<Box<ProbeResult>>,
    },
}

impl ProbeError {
    pub(crate) fn setup(test: TestType, reason: impl fmt::Display) -> Self {
        ProbeError::Failed {
            test,
            reason: reason.to_string(),
            partial: None,
        }
    }

    pub(crate) fn with_partial(
        test: TestType,
        reason: impl fmt::Display,
        partial: ProbeResult,
    ) -> Self {
        ProbeError::Failed {
            test,
            reason: reason.to_string(),
            partial: Some(Box::new(partial)),
        }
    }

    pub fn partial(&self) -> Option<&ProbeResult> {
        match self {
            ProbeError::Failed { partial, .. } => partial.as_deref(),
            ProbeError::Unsupported(_) => None,
        }
    }
}

/// Runs probes by test type name against the injected configuration.
#[derive(Clone)]
pub struct NetworkTester {
    conf: Arc<Conf>,
}

impl NetworkTester {
    pub fn new(conf: Arc<Conf>) -> Self {
        Self { conf }
    }

    pub async fn run_test(&self, test_type: &str) -> Result<ProbeResult, ProbeError> {
        let test = test_type.parse::<TestType>()?;
        self.run(test).await
    }

    pub async fn run(&self, test: TestType) -> Result<ProbeResult, ProbeError> {
        info!("Start {} test", test);
        let conf = &self.conf;
        let icmp_timeout = conf.icmp.timeout();
        match test {
            TestType::Icmp => IcmpDetector::new(conf.icmp.clone())
                .detect()
                .await
                .map(ProbeResult::Icmp),
            TestType::Tcp => TcpPingDetector::new(conf.tcp.clone())
                .detect()
                .await
                .map(ProbeResult::Tcp),
            TestType::Route => RouteDetector::new(conf.route.clone(), icmp_timeout)
                .detect()
                .await
                .map(ProbeResult::Route),
            TestType::Jitter => JitterDetector::new(conf.jitter.clone(), icmp_timeout)
                .detect_jitter()
                .await
                .map(ProbeResult::Jitter),
            TestType::Latency => JitterDetector::new(conf.latency.clone(), icmp_timeout)
                .detect_latency()
                .await
                .map(ProbeResult::Latency),
            TestType::Download => ThroughputDetector::new(conf.throughput.clone())
                .detect_download()
                .await
                .map(ProbeResult::Download),
            TestType::Upload => ThroughputDetector::new(conf.throughput.clone())
                .detect_upload()
                .await
                .map(ProbeResult::Upload),
            TestType::Bandwidth => BandwidthDetector::new(conf.bandwidth.clone())
                .detect()
                .await
                .map(ProbeResult::Bandwidth),
        }
    }

    /// Runs each test in order. Failures do not stop the remaining tests.
    pub async fn run_tests(&self, test_types: &[&str]) -> (Vec<ProbeResult>, Vec<ProbeError>) {
        let mut results = Vec::with_capacity(test_types.len());
        let mut errors = Vec::new();
        for test_type in test_types {
            match self.run_test(test_type).await {
                Ok(r) => results.push(r),
                Err(e) => {
                    warn!("{}", e);
                    errors.push(e);
                }
            }
        }
        (results, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Tcp;
    use tokio::net::TcpListener;

    #[test]
    fn parses_every_test_type_name() {
        for t in TestType::ALL {
            assert_eq!(t.as_str().parse::<TestType>().unwrap(), t);
        }
    }

    #[tokio::test]
    async fn unknown_test_type_is_unsupported() {
        let tester = NetworkTester::new(Arc::new(Conf::default()));
        let err = tester.run_test("smoke").await.unwrap_err();
        assert!(matches!(err, ProbeError::Unsupported(ref t) if t == "smoke"));
        assert_eq!(err.to_string(), "unsupported test type: smoke");
    }

    #[tokio::test]
    async fn dispatches_tcp_and_collects_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conf = Conf {
            tcp: Tcp {
                host: String::from("127.0.0.1"),
                ports: vec![port],
                timeout_secs: 2,
            },
            ..Conf::default()
        };
        let tester = NetworkTester::new(Arc::new(conf));

        let (results, errors) = tester.run_tests(&["tcp", "bogus", "bandwidth"]).await;
        assert_eq!(results.len(), 1);
        match &results[0] {
            ProbeResult::Tcp(r) => assert_eq!(r.successful_ports, 1),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(errors.len(), 2);
        assert!(errors[1].to_string().starts_with("bandwidth test failed"));
    }
}
