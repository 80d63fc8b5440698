use super::{ProbeError, TestType};
use crate::conf::Tcp;
use crate::structures::{PortResult, TcpResult};
use chrono::Utc;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

pub struct TcpPingDetector {
    conf: Tcp,
}

impl TcpPingDetector {
    pub fn new(conf: Tcp) -> Self {
        Self { conf }
    }

    #[tracing::instrument(skip(self), fields(host = %self.conf.host))]
    pub async fn detect(&self) -> Result<TcpResult, ProbeError> {
        if self.conf.host.is_empty() {
            return Err(ProbeError::setup(TestType::Tcp, "host cannot be empty"));
        }
        if self.conf.ports.is_empty() {
            return Err(ProbeError::setup(
                TestType::Tcp,
                "no TCP ports configured for testing",
            ));
        }

        let timestamp = Utc::now();
        let mut handlers = Vec::with_capacity(self.conf.ports.len());
        for &port in &self.conf.ports {
            let target = format!("{}:{}", self.conf.host, port);
            let timeout = self.conf.timeout();
            handlers.push(tokio::spawn(Self::tcp_ping(port, target, timeout)));
        }

        let mut port_results = Vec::with_capacity(handlers.len());
        for (handler, &port) in join_all(handlers).await.into_iter().zip(&self.conf.ports) {
            match handler {
                Ok(r) => port_results.push(r),
                Err(e) => {
                    warn!("Tcp ping task of port {} fail: {}", port, e);
                    port_results.push(PortResult {
                        port,
                        connected: false,
                        connect_time: Duration::ZERO,
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut result = aggregate(self.conf.host.clone(), port_results);
        result.timestamp = timestamp;
        info!(
            "Tcp test done successful:{} failed:{}",
            result.successful_ports, result.failed_ports
        );
        Ok(result)
    }

    async fn tcp_ping(port: u16, target: String, timeout: Duration) -> PortResult {
        let send_at = Instant::now();
        let conn = time::timeout(timeout, TcpStream::connect(&target)).await;
        let connect_time = send_at.elapsed();

        let error = match conn {
            Ok(Ok(_stream)) => String::new(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect to {} timed out after {:?}", target, timeout),
        };
        debug!("Port {} connect_time:{:?} error:{}", port, connect_time, error);

        PortResult {
            port,
            connected: error.is_empty(),
            connect_time,
            error,
        }
    }
}

pub(crate) fn aggregate(host: String, port_results: Vec<PortResult>) -> TcpResult {
    let mut result = TcpResult {
        host,
        timestamp: Utc::now(),
        port_results: Vec::with_capacity(port_results.len()),
        successful_ports: 0,
        failed_ports: 0,
        min_connect_time: Duration::ZERO,
        max_connect_time: Duration::ZERO,
        average_connect_time: Duration::ZERO,
    };
    let mut total = Duration::ZERO;

    for r in port_results {
        if r.connected {
            result.successful_ports += 1;
            if result.successful_ports == 1 || r.connect_time < result.min_connect_time {
                result.min_connect_time = r.connect_time;
            }
            if r.connect_time > result.max_connect_time {
                result.max_connect_time = r.connect_time;
            }
            total += r.connect_time;
        } else {
            result.failed_ports += 1;
        }
        result.port_results.push(r);
    }

    if result.successful_ports > 0 {
        result.average_connect_time = total / result.successful_ports;
    }
    result
}
