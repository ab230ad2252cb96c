//! HTTP task API channel
//!
//! Polls `GET {base}/task/nextjob/{collection}[.{type}]` for work (200 with a
//! task body, 204 when idle) and posts results to
//! `POST {base}/task/result/{correlation_id}/{collection}`, using basic auth.
//!
//! Fetching a job dequeues it on the server side, so acknowledgement is a
//! local bookkeeping step for this transport.

use super::traits::{Delivery, Receipt, TaskChannel};
use crate::config::BrokerConfig;
use crate::domain::errors::TaskError;
use crate::domain::outcome::TaskResult;
use crate::domain::{Result, TallyError};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use secrecy::ExposeSecret;
use std::time::Duration;
use url::Url;

/// [`TaskChannel`] over the HTTP task API
pub struct HttpTaskChannel {
    /// HTTP client for making requests
    client: Client,

    /// Base URL of the task API
    base_url: Url,

    /// Collection polled for jobs
    collection_id: String,

    /// Optional task type suffix
    task_type: Option<String>,

    username: String,
    password: crate::config::SecretString,
}

impl HttpTaskChannel {
    /// Create a new channel from the broker configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the base URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            TallyError::Configuration(format!("Invalid broker.base_url '{}': {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(TallyError::Configuration(format!(
                "broker.base_url '{}' cannot be used as a base URL",
                config.base_url
            )));
        }

        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| TallyError::Broker(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            collection_id: config.collection_id.clone(),
            task_type: config.task_type.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TallyError::Configuration("broker.base_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn next_job_url(&self) -> Result<Url> {
        let target = match &self.task_type {
            Some(task_type) => format!("{}.{}", self.collection_id, task_type),
            None => self.collection_id.clone(),
        };
        self.endpoint(&["task", "nextjob", &target])
    }

    fn result_url(&self, result: &TaskResult) -> Result<Url> {
        self.endpoint(&[
            "task",
            "result",
            result.correlation_id.as_str(),
            result.reply_to.as_str(),
        ])
    }
}

#[async_trait]
impl TaskChannel for HttpTaskChannel {
    async fn receive(&self) -> Result<Option<Delivery>> {
        let url = self.next_job_url()?;

        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(self.password.expose_secret().as_str()))
            .send()
            .await
            .map_err(|e| TallyError::Broker(format!("Polling for jobs failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let payload = response
                    .bytes()
                    .await
                    .map_err(|e| TallyError::Broker(format!("Failed to read job body: {e}")))?;
                let receipt = Receipt::new(format!("http-{}", uuid::Uuid::new_v4()));
                tracing::info!(receipt = %receipt, bytes = payload.len(), "Received job");
                Ok(Some(Delivery {
                    receipt,
                    payload: payload.to_vec(),
                }))
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TallyError::Broker(format!(
                    "Polling for jobs returned status {status}: {body}"
                )))
            }
        }
    }

    async fn publish(&self, result: &TaskResult) -> std::result::Result<(), TaskError> {
        let url = self
            .result_url(result)
            .map_err(|e| TaskError::Publish(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(self.password.expose_secret().as_str()))
            .json(result)
            .send()
            .await
            .map_err(|e| TaskError::Publish(format!("Sending result failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                correlation_id = %result.correlation_id,
                status = status.as_u16(),
                "Result delivered"
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            // Resending the same body cannot fix a rejected result.
            tracing::warn!(
                correlation_id = %result.correlation_id,
                status = status.as_u16(),
                body = %body,
                "Result rejected by task API, not retrying"
            );
            return Ok(());
        }

        Err(TaskError::Publish(format!(
            "Task API returned status {status}: {body}"
        )))
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<()> {
        tracing::debug!(receipt = %receipt, "Job already dequeued by the task API");
        Ok(())
    }
}
