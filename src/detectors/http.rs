use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0.0.0";

pub(crate) fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Reads the whole body chunk by chunk without keeping it. On a read error the
/// bytes received so far are returned together with the error.
pub(crate) async fn read_body_discarding(
    mut resp: Response,
) -> Result<u64, (u64, reqwest::Error)> {
    let mut received = 0_u64;
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => received += chunk.len() as u64,
            Ok(None) => return Ok(received),
            Err(e) => return Err((received, e)),
        }
    }
}

/// GETs `url`, requires 200 and drains the body.
pub(crate) async fn download(client: &Client, url: &str) -> Result<u64, DownloadError> {
    let resp = client.get(url).send().await.map_err(DownloadError::Connect)?;
    if resp.status() != StatusCode::OK {
        return Err(DownloadError::Status(resp.status()));
    }
    read_body_discarding(resp)
        .await
        .map_err(|(received, e)| DownloadError::Body { received, source: e })
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DownloadError {
    #[error("failed to execute request: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("unexpected status code: {0}")]
    Status(StatusCode),
    #[error("body read failed after {received} bytes: {source}")]
    Body {
        received: u64,
        #[source]
        source: reqwest::Error,
    },
}

impl DownloadError {
    pub(crate) fn received(&self) -> u64 {
        match self {
            DownloadError::Body { received, .. } => *received,
            _ => 0,
        }
    }
}
