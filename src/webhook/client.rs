//! Outbound webhook client.
//!
//! Dispatches work to the external analysis engine over HTTP. Requests are
//! signed per the auth configuration and retried with a linear delay on
//! 5xx and connection failures; 4xx responses are terminal.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use super::auth;
use super::payload::DispatchPayload;
use super::DispatchError;
use crate::config::{AuthConfig, WebhookConfig};
use crate::models::{JobStatus, JobUpdate, QueueItem, TriggerType};
use crate::queue::Dispatcher;
use crate::tracker::JobTracker;

/// HTTP client for the analysis engine.
#[derive(Clone)]
pub struct WebhookClient {
    http: Client,
    config: WebhookConfig,
    auth: AuthConfig,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig, auth: AuthConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .expect("Failed to create HTTP client");
        Self { http, config, auth }
    }

    /// Engine endpoint for a workflow type.
    fn endpoint(&self, payload: &DispatchPayload) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            payload.workflow_type.as_str()
        )
    }

    /// Send one dispatch, retrying per configuration.
    pub async fn dispatch(&self, payload: &DispatchPayload) -> Result<(), DispatchError> {
        payload.validate()?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| DispatchError::Validation(format!("payload serialization: {e}")))?;
        let endpoint = self.endpoint(payload);
        let path = url::Url::parse(&endpoint)
            .map(|u| u.path().to_string())
            .map_err(|e| DispatchError::Validation(format!("bad webhook URL: {e}")))?;

        let mut last_error = DispatchError::Network("no attempt made".to_string());
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(
                    self.config.retry_delay_ms * attempt as u64,
                ))
                .await;
            }

            let timestamp = chrono::Utc::now().timestamp();
            let mut request = self
                .http
                .post(&endpoint)
                .header(CONTENT_TYPE, "application/json")
                .header("X-Timestamp", timestamp)
                .body(body.clone());
            if !self.auth.api_key.is_empty() {
                request = request.header("X-API-Key", &self.auth.api_key);
            }
            if self.auth.enable_hmac {
                let signature =
                    auth::sign(&self.auth.shared_secret, "POST", &path, timestamp, &body);
                request = request.header("X-Signature", signature);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        tracing::debug!(
                            job = %payload.job_id,
                            endpoint = %endpoint,
                            attempt,
                            "dispatch accepted"
                        );
                        return Ok(());
                    }
                    if status.is_client_error() {
                        return Err(DispatchError::Client(status.as_u16()));
                    }
                    last_error = DispatchError::Server(status.as_u16());
                }
                Err(e) if e.is_timeout() => last_error = DispatchError::Timeout,
                Err(e) => last_error = DispatchError::Network(e.to_string()),
            }
            tracing::warn!(
                job = %payload.job_id,
                attempt,
                error = %last_error,
                "dispatch attempt failed"
            );
        }
        Err(last_error)
    }

    /// Short-timeout reachability probe used by the health endpoint.
    pub async fn probe(&self) -> bool {
        let request = self
            .http
            .head(self.config.base_url.trim_end_matches('/'))
            .timeout(Duration::from_secs(2));
        match request.send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.config.timeout_seconds
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[async_trait::async_trait]
impl Dispatcher for WebhookClient {
    async fn dispatch(&self, item: &QueueItem) -> anyhow::Result<()> {
        let payload = DispatchPayload::for_item(
            item,
            self.config.timeout_seconds.clamp(1, 3600),
            self.config.max_retries.min(10),
        );
        WebhookClient::dispatch(self, &payload).await?;
        Ok(())
    }
}

/// Dispatcher that also keeps the job tracker in step: the job record is
/// created when the item first dispatches and moves to Processing once the
/// engine accepts it.
pub struct TrackingDispatcher {
    client: Arc<WebhookClient>,
    tracker: Arc<JobTracker>,
}

impl TrackingDispatcher {
    pub fn new(client: Arc<WebhookClient>, tracker: Arc<JobTracker>) -> Self {
        Self { client, tracker }
    }
}

#[async_trait::async_trait]
impl Dispatcher for TrackingDispatcher {
    async fn dispatch(&self, item: &QueueItem) -> anyhow::Result<()> {
        let job = self
            .tracker
            .create_job(
                &item.job_id,
                &item.deal_name,
                TriggerType::FileChange,
                vec![item.document_path.clone()],
            )
            .await;

        match Dispatcher::dispatch(self.client.as_ref(), item).await {
            Ok(()) => {
                let result = if job.status.can_resume() {
                    // A retry after a failed dispatch restarts the job.
                    self.tracker.resume_job(&item.job_id).await
                } else {
                    self.tracker
                        .update_job(
                            &item.job_id,
                            JobUpdate {
                                status: Some(JobStatus::Processing),
                                current_step: Some("dispatched".to_string()),
                                ..Default::default()
                            },
                        )
                        .await
                };
                if let Err(e) = result {
                    tracing::warn!(job = %item.job_id, error = %e, "job status update after dispatch");
                }
                Ok(())
            }
            Err(e) => {
                if let Err(update_err) = self
                    .tracker
                    .fail_job(&item.job_id, &format!("dispatch failed: {e}"))
                    .await
                {
                    tracing::debug!(job = %item.job_id, error = %update_err, "job already failed");
                }
                Err(e)
            }
        }
    }
}
