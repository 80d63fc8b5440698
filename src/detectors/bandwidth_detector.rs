use super::http::{build_client, download};
use super::{ProbeError, TestType};
use crate::conf::Bandwidth;
use crate::structures::{BandwidthResult, ConnectionResult, ConnectionStep};
use crate::util::mbps;
use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct BandwidthDetector {
    conf: Bandwidth,
}

impl BandwidthDetector {
    pub fn new(conf: Bandwidth) -> Self {
        Self { conf }
    }

    #[tracing::instrument(skip(self), fields(url = %self.conf.download_url))]
    pub async fn detect(&self) -> Result<BandwidthResult, ProbeError> {
        if self.conf.download_url.is_empty() {
            return Err(ProbeError::setup(
                TestType::Bandwidth,
                "no download URL configured",
            ));
        }
        let client = build_client(self.conf.timeout()).map_err(|e| {
            ProbeError::setup(TestType::Bandwidth, format!("build http client: {}", e))
        })?;

        let mut result = BandwidthResult {
            start_time: Utc::now(),
            end_time: Utc::now(),
            steps: Vec::new(),
            optimal_conns: 0,
            max_throughput: 0.0,
            failure_point: 0,
            total_data: 0,
        };

        let mut conns = self.conf.initial_connections;
        while conns <= self.conf.max_connections {
            info!("Testing bandwidth with {} concurrent connections", conns);
            let step = self.run_step(&client, conns).await;
            if record_step(&mut result, step, self.conf.fail_threshold) {
                info!("Bandwidth degradation detected at {} connections", conns);
                break;
            }
            conns = match conns.checked_add(self.conf.step_size) {
                Some(next) => next,
                None => break,
            };
        }

        result.end_time = Utc::now();
        info!(
            "Bandwidth test done optimal:{} max:{:.2} Mbps failure_point:{}",
            result.optimal_conns, result.max_throughput, result.failure_point
        );
        Ok(result)
    }

    async fn run_step(&self, client: &Client, conns: u32) -> ConnectionStep {
        let step_start = Instant::now();

        let mut handlers = Vec::with_capacity(conns as usize);
        for id in 0..conns {
            let client = client.clone();
            let url = self.conf.download_url.clone();
            handlers.push(tokio::spawn(async move {
                let start = Instant::now();
                let downloaded = download(&client, &url).await;
                let duration = start.elapsed();
                let (bytes_recv, error) = match downloaded {
                    Ok(n) => (n, None),
                    Err(e) => (e.received(), Some(e.to_string())),
                };
                ConnectionResult {
                    id,
                    bytes_recv,
                    duration,
                    speed: mbps(bytes_recv, duration),
                    error,
                }
            }));
        }

        let mut conn_results = Vec::with_capacity(handlers.len());
        for (id, handler) in (0..conns).zip(join_all(handlers).await) {
            match handler {
                Ok(r) => {
                    match &r.error {
                        Some(e) => warn!("Connection {} error: {}", r.id, e),
                        None => debug!("Connection {} speed:{:.2} Mbps", r.id, r.speed),
                    }
                    conn_results.push(r);
                }
                Err(e) => {
                    warn!("Connection {} task fail: {}", id, e);
                    conn_results.push(ConnectionResult {
                        id,
                        bytes_recv: 0,
                        duration: step_start.elapsed(),
                        speed: 0.0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        build_step(conns, conn_results, step_start.elapsed())
    }
}

/// Aggregates one concurrency level. `avg_speed` is the per-connection share of
/// the step's bytes over the step's wall clock time.
pub(crate) fn build_step(
    connections: u32,
    conn_results: Vec<ConnectionResult>,
    duration: std::time::Duration,
) -> ConnectionStep {
    let total_bytes: u64 = conn_results.iter().map(|r| r.bytes_recv).sum();
    let moving = conn_results.iter().filter(|r| r.bytes_recv > 0).count() as u64;

    let avg_speed = if moving > 0 {
        mbps(total_bytes / moving, duration)
    } else {
        0.0
    };
    info!(
        "Step complete: {}/{} connections moved data, {:.2} Mbps per connection",
        moving, connections, avg_speed
    );

    ConnectionStep {
        connections,
        conn_results,
        total_bytes,
        avg_speed,
        duration,
        failed: moving == 0,
    }
}

/// Records a finished step and reports whether stepping must stop.
pub(crate) fn record_step(
    result: &mut BandwidthResult,
    step: ConnectionStep,
    threshold: f64,
) -> bool {
    let conns = step.connections;
    let speed = step.avg_speed;
    result.total_data += step.total_bytes;
    result.steps.push(step);

    if speed > result.max_throughput {
        result.max_throughput = speed;
        result.optimal_conns = conns;
        info!("New max bandwidth {:.2} Mbps with {} connections", speed, conns);
    }

    if result.steps.len() < 2 || result.max_throughput == 0.0 || speed == 0.0 {
        return false;
    }

    let drop_pct = (result.max_throughput - speed) / result.max_throughput * 100.0;
    debug!(
        "Max:{:.2} current:{:.2} drop:{:.1}% threshold:{:.1}%",
        result.max_throughput, speed, drop_pct, threshold
    );
    if drop_pct > 0.0 && drop_pct >= threshold {
        result.failure_point = conns;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn empty_result() -> BandwidthResult {
        BandwidthResult {
            start_time: Utc::now(),
            end_time: Utc::now(),
            steps: Vec::new(),
            optimal_conns: 0,
            max_throughput: 0.0,
            failure_point: 0,
            total_data: 0,
        }
    }

    fn step(connections: u32, avg_speed: f64) -> ConnectionStep {
        ConnectionStep {
            connections,
            conn_results: Vec::new(),
            total_bytes: 1000,
            avg_speed,
            duration: Duration::from_secs(1),
            failed: false,
        }
    }

    fn conn(id: u32, bytes_recv: u64, error: Option<&str>) -> ConnectionResult {
        ConnectionResult {
            id,
            bytes_recv,
            duration: Duration::from_secs(1),
            speed: mbps(bytes_recv, Duration::from_secs(1)),
            error: error.map(String::from),
        }
    }

    #[test]
    fn step_totals_every_connection() {
        let s = build_step(
            3,
            vec![
                conn(0, 1024 * 1024, None),
                conn(1, 512 * 1024, Some("reset")),
                conn(2, 0, Some("refused")),
            ],
            Duration::from_secs(1),
        );
        assert_eq!(s.total_bytes, 1024 * 1024 + 512 * 1024);
        assert_eq!(
            s.total_bytes,
            s.conn_results.iter().map(|c| c.bytes_recv).sum::<u64>()
        );
        // two connections moved data: 1.5 MiB / 2 over one second
        assert_eq!(s.avg_speed, 6.0);
        assert!(!s.failed);
    }

    #[test]
    fn step_without_data_is_failed() {
        let s = build_step(
            2,
            vec![conn(0, 0, Some("a")), conn(1, 0, Some("b"))],
            Duration::from_secs(1),
        );
        assert!(s.failed);
        assert_eq!(s.avg_speed, 0.0);
    }

    #[test]
    fn stops_at_first_step_crossing_threshold() {
        let mut r = empty_result();
        assert!(!record_step(&mut r, step(1, 100.0), 50.0));
        assert!(!record_step(&mut r, step(2, 120.0), 50.0));
        assert!(!record_step(&mut r, step(3, 80.0), 50.0));
        assert!(record_step(&mut r, step(4, 50.0), 50.0));

        assert_eq!(r.optimal_conns, 2);
        assert_eq!(r.max_throughput, 120.0);
        assert_eq!(r.failure_point, 4);
        assert!(r.failure_point > r.optimal_conns);
        assert_eq!(r.total_data, 4000);

        let peak = r.steps.iter().find(|s| s.avg_speed == r.max_throughput).unwrap();
        assert_eq!(peak.connections, r.optimal_conns);
    }

    #[test]
    fn first_step_never_stops_and_zero_threshold_needs_a_drop() {
        let mut r = empty_result();
        assert!(!record_step(&mut r, step(1, 10.0), 0.0));
        assert!(!record_step(&mut r, step(2, 20.0), 0.0));
        assert!(record_step(&mut r, step(3, 19.0), 0.0));
        assert_eq!(r.failure_point, 3);
        assert_eq!(r.optimal_conns, 2);
    }

    #[test]
    fn failed_step_does_not_trip_threshold() {
        let mut r = empty_result();
        assert!(!record_step(&mut r, step(1, 10.0), 10.0));
        assert!(!record_step(&mut r, step(2, 0.0), 10.0));
        assert_eq!(r.failure_point, 0);
    }

    #[tokio::test]
    async fn healthy_endpoint_produces_steps_with_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0_u8; 256 * 1024]))
            .mount(&server)
            .await;

        let detector = BandwidthDetector::new(Bandwidth {
            download_url: format!("{}/blob", server.uri()),
            initial_connections: 1,
            max_connections: 4,
            step_size: 1,
            fail_threshold: 50.0,
            timeout_secs: 30,
        });
        let r = detector.detect().await.unwrap();

        assert!((1..=4).contains(&r.steps.len()));
        assert!(r.steps.iter().all(|s| s.total_bytes > 0));
        for (i, s) in r.steps.iter().enumerate() {
            assert_eq!(s.connections, i as u32 + 1);
            assert_eq!(s.conn_results.len(), s.connections as usize);
        }
        assert!(r.optimal_conns >= 1);
        if r.failure_point > 0 {
            assert!(r.failure_point > r.optimal_conns);
        }
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let detector = BandwidthDetector::new(Bandwidth::default());
        let err = detector.detect().await.unwrap_err();
        assert!(err.to_string().contains("no download URL configured"));
    }
}
