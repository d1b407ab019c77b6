use std::time::Duration;
use anyhow::{Context, Result};
use reqwest::Url;
use shared::protocol::STATUS_REPORT_PATH;
use shared::types::{StatusReply, StatusReport};
use crate::config::ReporterConfig;
use crate::presence::{StatusSink, Transition};

/// Forwards transitions to the remote status service.
///
/// Reports are fire-and-forget: a failed or timed out request is logged and
/// dropped, never retried, since local presence state has already moved on.
#[derive(Clone)]
pub struct StatusReporter {
    client: reqwest::Client,
    url: Option<Url>,
}

impl StatusReporter {
    pub fn new(endpoint: Option<&str>, timeout: Duration) -> Result<Self> {
        let url = endpoint
            .map(|base| {
                status_url(base).with_context(|| format!("Invalid status endpoint: {}", base))
            })
            .transpose()?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }

    pub fn from_config(config: &ReporterConfig) -> Result<Self> {
        Self::new(config.endpoint.as_deref(), Duration::from_secs(config.timeout_secs))
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Send one report and wait for the reply
    pub async fn send(&self, report: &StatusReport) -> Result<Option<StatusReply>> {
        let Some(url) = &self.url else {
            return Ok(None);
        };

        let resp = self
            .client
            .post(url.clone())
            .json(report)
            .send()
            .await
            .context("Failed to send device status")?
            .error_for_status()
            .context("Status service rejected report")?;

        let reply = resp
            .json()
            .await
            .context("Failed to parse status reply")?;
        Ok(Some(reply))
    }
}

/// Status path under the endpoint, keeping any path prefix it carries
fn status_url(base: &str) -> Result<Url> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let prefixed = format!("{}/", base.path());
        base.set_path(&prefixed);
    }
    Ok(base.join(STATUS_REPORT_PATH.trim_start_matches('/'))?)
}

impl StatusSink for StatusReporter {
    async fn report(&self, transition: &Transition) {
        let report = StatusReport {
            identifier: transition.identifier.clone(),
            status: transition.status,
        };

        match self.send(&report).await {
            Ok(Some(reply)) => {
                tracing::info!(
                    "Reported {} {:?}, server replied: {}",
                    report.identifier,
                    report.status,
                    reply.message
                );
            }
            Ok(None) => {
                tracing::info!(
                    "Status reporting disabled, dropping {} {:?}",
                    report.identifier,
                    report.status
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to report {} {:?}: {:#}",
                    report.identifier,
                    report.status,
                    e
                );
            }
        }
    }
}
