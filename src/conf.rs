use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Probe network quality and run the probes on a schedule.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the agent configuration file
    #[clap(short, long, default_value = "./config.toml")]
    pub conf: String,

    /// Run the given test types once, print their results and exit
    #[clap(short, long = "test")]
    pub tests: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Conf {
    pub log: Log,
    pub icmp: Icmp,
    pub route: Route,
    pub jitter: Sampling,
    pub latency: Sampling,
    pub tcp: Tcp,
    pub throughput: Throughput,
    pub bandwidth: Bandwidth,
    pub scheduler: SchedulerConf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Log {
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Icmp {
    pub target: String,
    pub packet_count: u16,
    pub timeout_secs: u64,
}

impl Default for Icmp {
    fn default() -> Self {
        Self {
            target: String::from("8.8.8.8"),
            packet_count: 4,
            timeout_secs: 2,
        }
    }
}

impl Icmp {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Route {
    pub target: String,
    pub max_hops: u8,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            target: String::from("8.8.8.8"),
            max_hops: 30,
        }
    }
}

/// Shared by the jitter and latency sections.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Sampling {
    pub target: String,
    pub packet_count: u16,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            target: String::from("8.8.8.8"),
            packet_count: 20,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Tcp {
    pub host: String,
    pub ports: Vec<u16>,
    pub timeout_secs: u64,
}

impl Default for Tcp {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            ports: vec![80, 443],
            timeout_secs: 5,
        }
    }
}

impl Tcp {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Throughput {
    pub download_urls: Vec<String>,
    pub upload_urls: Vec<String>,
    pub upload_size_bytes: usize,
    pub timeout_secs: u64,
}

impl Default for Throughput {
    fn default() -> Self {
        Self {
            download_urls: Vec::new(),
            upload_urls: Vec::new(),
            upload_size_bytes: 10 * 1024 * 1024,
            timeout_secs: 30,
        }
    }
}

impl Throughput {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Bandwidth {
    pub download_url: String,
    pub initial_connections: u32,
    pub max_connections: u32,
    pub step_size: u32,
    /// Percentage drop from peak throughput that ends the test.
    pub fail_threshold: f64,
    pub timeout_secs: u64,
}

impl Default for Bandwidth {
    fn default() -> Self {
        Self {
            download_url: String::new(),
            initial_connections: 1,
            max_connections: 8,
            step_size: 1,
            fail_threshold: 50.0,
            timeout_secs: 300,
        }
    }
}

impl Bandwidth {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConf {
    /// Base url of the agent's own api, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    pub schedule_path: PathBuf,
    pub check_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub workers: usize,
    pub queue_size: usize,
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self {
            base_url: String::from("http://127.0.0.1:8080"),
            schedule_path: PathBuf::from("data/schedule.json"),
            check_interval_secs: 60,
            request_timeout_secs: 30,
            workers: 4,
            queue_size: 64,
        }
    }
}

impl SchedulerConf {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Conf {
    pub fn from_toml(s: &str) -> Result<Self> {
        let conf = toml::from_str::<Conf>(s)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.icmp.packet_count == 0 {
            bail!("icmp.packet_count must be at least 1");
        }
        if self.jitter.packet_count == 0 || self.latency.packet_count == 0 {
            bail!("jitter/latency packet_count must be at least 1");
        }
        if self.route.max_hops == 0 {
            bail!("route.max_hops must be at least 1");
        }

        let bw = &self.bandwidth;
        if bw.initial_connections == 0 || bw.step_size == 0 {
            bail!("bandwidth.initial_connections and bandwidth.step_size must be at least 1");
        }
        if bw.max_connections < bw.initial_connections {
            bail!(
                "bandwidth.max_connections {} is below initial_connections {}",
                bw.max_connections,
                bw.initial_connections
            );
        }
        if !(bw.fail_threshold >= 0.0) {
            bail!("bandwidth.fail_threshold must be a non-negative percentage");
        }

        if self.scheduler.workers == 0 || self.scheduler.queue_size == 0 {
            bail!("scheduler.workers and scheduler.queue_size must be at least 1");
        }
        if self.scheduler.check_interval_secs == 0 {
            bail!("scheduler.check_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

pub async fn read_conf(path: &str) -> Result<Conf> {
    use tokio::fs;

    let conf = fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path))?;
    Conf::from_toml(&conf)
}
