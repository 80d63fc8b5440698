use super::http::{build_client, download, read_body_discarding, DownloadError};
use super::{ProbeError, TestType};
use crate::conf::Throughput;
use crate::structures::{Direction, ProbeResult, SpeedSample, ThroughputResult};
use crate::util::{format_bytes, format_duration, mbps};
use bytes::Bytes;
use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use reqwest::{header, Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Outcome of one url: the sample to record, plus the error when it failed.
pub(crate) struct UrlOutcome {
    pub url: String,
    pub sample: SpeedSample,
    pub error: Option<String>,
}

impl UrlOutcome {
    fn ok(url: &str, sample: SpeedSample) -> Self {
        Self {
            url: url.to_string(),
            sample,
            error: None,
        }
    }

    fn failed(url: &str, status: impl Into<String>, error: impl ToString) -> Self {
        Self {
            url: url.to_string(),
            sample: SpeedSample::failed(status),
            error: Some(error.to_string()),
        }
    }
}

pub struct ThroughputDetector {
    conf: Throughput,
}

impl ThroughputDetector {
    pub fn new(conf: Throughput) -> Self {
        Self { conf }
    }

    fn client(&self, test: TestType) -> Result<Client, ProbeError> {
        build_client(self.conf.timeout())
            .map_err(|e| ProbeError::setup(test, format!("build http client: {}", e)))
    }

    #[tracing::instrument(skip(self))]
    pub async fn detect_download(&self) -> Result<ThroughputResult, ProbeError> {
        let client = self.client(TestType::Download)?;
        let mut outcomes = Vec::with_capacity(self.conf.download_urls.len());
        for url in &self.conf.download_urls {
            outcomes.push(Self::measure_download(&client, url).await);
        }
        fold_outcomes(Direction::Download, outcomes)
    }

    async fn measure_download(client: &Client, url: &str) -> UrlOutcome {
        let start = Instant::now();
        let bytes = match download(client, url).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Download from {} fail: {}", url, e);
                let status = match &e {
                    DownloadError::Connect(_) => String::from("FAILED - Connection Error"),
                    DownloadError::Status(code) => format!("FAILED - HTTP {}", code.as_u16()),
                    DownloadError::Body { .. } => String::from("FAILED - Download Error"),
                };
                let mut outcome = UrlOutcome::failed(url, status, &e);
                outcome.sample.bytes = e.received();
                return outcome;
            }
        };

        let elapsed = start.elapsed();
        UrlOutcome::ok(url, speed_sample(bytes, elapsed, "downloaded"))
    }

    #[tracing::instrument(skip(self))]
    pub async fn detect_upload(&self) -> Result<ThroughputResult, ProbeError> {
        let client = self.client(TestType::Upload)?;
        let payload = random_payload(self.conf.upload_size_bytes);

        let mut outcomes = Vec::with_capacity(self.conf.upload_urls.len());
        for url in &self.conf.upload_urls {
            outcomes.push(Self::measure_upload(&client, url, payload.clone()).await);
        }
        fold_outcomes(Direction::Upload, outcomes)
    }

    async fn measure_upload(client: &Client, url: &str, payload: Bytes) -> UrlOutcome {
        let bytes = payload.len() as u64;
        let start = Instant::now();
        let resp = client
            .post(url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!("Upload to {} fail: {}", url, e);
                return UrlOutcome::failed(url, "FAILED - Connection Error", e);
            }
        };

        let status = resp.status();
        if let Err((_, e)) = read_body_discarding(resp).await {
            return UrlOutcome::failed(url, "FAILED - Response Error", e);
        }
        if status != StatusCode::OK {
            warn!("Upload to {} answered {}", url, status);
            return UrlOutcome::failed(
                url,
                format!("FAILED - HTTP {}", status.as_u16()),
                format!("upload failed with status: {}", status.as_u16()),
            );
        }

        let elapsed = start.elapsed();
        UrlOutcome::ok(url, speed_sample(bytes, elapsed, "uploaded"))
    }
}

fn random_payload(len: usize) -> Bytes {
    let mut data = vec![0_u8; len];
    SmallRng::from_entropy().fill_bytes(&mut data);
    Bytes::from(data)
}

fn speed_sample(bytes: u64, elapsed: Duration, verb: &str) -> SpeedSample {
    let speed = mbps(bytes, elapsed);
    SpeedSample {
        speed,
        status: format!(
            "{:.2} Mbps ({} {} in {})",
            speed,
            format_bytes(bytes),
            verb,
            format_duration(elapsed)
        ),
        duration: elapsed,
        bytes,
    }
}

/// Averages the successful urls; fails with the last error when none succeeded.
pub(crate) fn fold_outcomes(
    direction: Direction,
    outcomes: Vec<UrlOutcome>,
) -> Result<ThroughputResult, ProbeError> {
    let mut total_speed = 0.0;
    let mut total_bytes = 0_u64;
    let mut total_time = Duration::ZERO;
    let mut successful = 0_u32;
    let mut last_error = None;
    let mut tested_urls = BTreeMap::new();

    for outcome in outcomes {
        match outcome.error {
            Some(e) => last_error = Some(e),
            None => {
                total_speed += outcome.sample.speed;
                total_bytes += outcome.sample.bytes;
                total_time += outcome.sample.duration;
                successful += 1;
            }
        }
        tested_urls.insert(outcome.url, outcome.sample);
    }

    let (test, label) = match direction {
        Direction::Download => (TestType::Download, "Average"),
        Direction::Upload => (TestType::Upload, "Average Upload"),
    };

    if successful == 0 {
        let status = match direction {
            Direction::Download => "All tests failed",
            Direction::Upload => "All upload tests failed",
        };
        let result = ThroughputResult {
            timestamp: Utc::now(),
            direction,
            status: String::from(status),
            average_mbps: 0.0,
            elapsed_time: Duration::ZERO,
            bytes_received: 0,
            tested_urls,
        };
        let reason = last_error.unwrap_or_else(|| format!("no {} urls configured", test));
        let partial = match direction {
            Direction::Download => ProbeResult::Download(result),
            Direction::Upload => ProbeResult::Upload(result),
        };
        return Err(ProbeError::with_partial(test, reason, partial));
    }

    let average_mbps = total_speed / f64::from(successful);
    let result = ThroughputResult {
        timestamp: Utc::now(),
        direction,
        status: format!(
            "{}: {:.2} Mbps, Total: {}, Time: {}",
            label,
            average_mbps,
            format_bytes(total_bytes),
            format_duration(total_time)
        ),
        average_mbps,
        elapsed_time: total_time / successful,
        bytes_received: total_bytes / u64::from(successful),
        tested_urls,
    };
    info!("{} test done: {}", test, result.status);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn conf(download_urls: Vec<String>, upload_urls: Vec<String>) -> Throughput {
        Throughput {
            download_urls,
            upload_urls,
            upload_size_bytes: 64 * 1024,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn download_averages_successes_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1mb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1_u8; 1024 * 1024]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let good = format!("{}/1mb", server.uri());
        let bad = format!("{}/missing", server.uri());
        let detector = ThroughputDetector::new(conf(vec![good.clone(), bad.clone()], vec![]));
        let result = detector.detect_download().await.unwrap();

        assert_eq!(result.direction, Direction::Download);
        assert_eq!(result.bytes_received, 1024 * 1024);
        assert!(result.average_mbps > 0.0);
        assert_eq!(result.tested_urls[&bad].status, "FAILED - HTTP 500");
        assert_eq!(result.tested_urls[&good].bytes, 1024 * 1024);
        assert!(result.status.starts_with("Average: "));
    }

    #[tokio::test]
    async fn all_downloads_failing_returns_documented_partial() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let a = format!("{}/a", server.uri());
        let b = format!("{}/b", server.uri());
        let detector = ThroughputDetector::new(conf(vec![a.clone(), b.clone()], vec![]));
        let err = detector.detect_download().await.unwrap_err();

        assert!(err.to_string().contains("unexpected status code"));
        match err.partial() {
            Some(ProbeResult::Download(r)) => {
                assert_eq!(r.tested_urls.len(), 2);
                assert_eq!(r.status, "All tests failed");
                assert!(r.tested_urls.values().all(|s| s.status.starts_with("FAILED")));
            }
            other => panic!("unexpected partial {:?}", other),
        }
    }

    #[tokio::test]
    async fn upload_requires_http_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/created"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let ok = format!("{}/ok", server.uri());
        let created = format!("{}/created", server.uri());
        let detector = ThroughputDetector::new(conf(vec![], vec![ok.clone(), created.clone()]));
        let result = detector.detect_upload().await.unwrap();

        assert_eq!(result.direction, Direction::Upload);
        assert_eq!(result.bytes_received, 64 * 1024);
        assert_eq!(result.tested_urls[&created].status, "FAILED - HTTP 201");
        assert!(result.tested_urls[&ok].status.contains("uploaded"));

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.body.len() == 64 * 1024));
    }

    #[tokio::test]
    async fn no_urls_configured_fails() {
        let detector = ThroughputDetector::new(conf(vec![], vec![]));
        let err = detector.detect_download().await.unwrap_err();
        assert!(err.to_string().contains("no download urls configured"));
    }
}
