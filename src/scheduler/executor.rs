use crate::detectors::TestType;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Test(TestType),
    Chart { chart_type: String, date: NaiveDate },
    HistoricChart { chart_type: String, days: u32 },
}

/// One fired task, waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub task: String,
    pub action: Action,
}

impl Job {
    pub fn url(&self, base_url: &str) -> Result<Url, JobError> {
        let base = base_url.trim_end_matches('/');
        let (path, query) = match &self.action {
            Action::Test(test) => ("networktest", vec![("test", test.to_string())]),
            Action::Chart { chart_type, date } => (
                "charts/generate",
                vec![
                    ("test", chart_type.clone()),
                    ("date", date.format("%Y-%m-%d").to_string()),
                ],
            ),
            Action::HistoricChart { chart_type, days } => (
                "charts/generate-historic",
                vec![("test", chart_type.clone()), ("days", days.to_string())],
            ),
        };

        let mut url = Url::parse(&format!("{}/{}", base, path))
            .map_err(|e| JobError::Url(format!("{}: {}", base_url, e)))?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    /// Probe triggers are fire-and-forget; only chart generation reports its status.
    fn checks_status(&self) -> bool {
        !matches!(self.action, Action::Test(_))
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::Test(test) => write!(f, "{} (test {})", self.task, test),
            Action::Chart { chart_type, date } => {
                write!(f, "{} (chart {} for {})", self.task, chart_type, date)
            }
            Action::HistoricChart { chart_type, days } => {
                write!(f, "{} (chart {} over {} days)", self.task, chart_type, days)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid base url {0}")]
    Url(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub result: Result<StatusCode, JobError>,
}

pub(crate) fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder().timeout(timeout).build()
}

/// Starts `count` workers sharing one job queue. Workers exit when the queue
/// closes, the outcome receiver goes away or shutdown is signalled.
pub(crate) fn spawn_workers(
    count: usize,
    client: Client,
    base_url: String,
    jobs: mpsc::Receiver<Job>,
    outcomes: mpsc::Sender<JobOutcome>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let jobs = Arc::new(Mutex::new(jobs));
    let base_url: Arc<str> = Arc::from(base_url);

    (0..count)
        .map(|id| {
            let worker = worker_loop(
                jobs.clone(),
                client.clone(),
                base_url.clone(),
                outcomes.clone(),
                shutdown.clone(),
            );
            tokio::spawn(worker.instrument(info_span!("scheduler_worker", id)))
        })
        .collect()
}

async fn worker_loop(
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    client: Client,
    base_url: Arc<str>,
    outcomes: mpsc::Sender<JobOutcome>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            job = async { jobs.lock().await.recv().await } => job,
            _ = shutdown.changed() => None,
        };
        let job = match job {
            Some(j) => j,
            None => break,
        };

        debug!("Run job {}", job);
        let result = execute(&client, &base_url, &job).await;
        if outcomes.send(JobOutcome { job, result }).await.is_err() {
            break;
        }
    }
    debug!("Scheduler worker exit");
}

async fn execute(client: &Client, base_url: &str, job: &Job) -> Result<StatusCode, JobError> {
    let url = job.url(base_url)?;
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if job.checks_status() && status != StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(JobError::Status { status, body });
    }
    Ok(status)
}

pub(crate) async fn log_outcomes(mut outcomes: mpsc::Receiver<JobOutcome>) {
    while let Some(outcome) = outcomes.recv().await {
        match outcome.result {
            Ok(status) => info!("Task {} done, status {}", outcome.job, status),
            Err(e) => warn!("Task {} fail: {}", outcome.job, e),
        }
    }
}
