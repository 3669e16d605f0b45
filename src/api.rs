use std::{future::Future, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::{
    consts::ERROR_DETAIL_MAX_CHARS,
    core::truncate_message,
    error::{LiveError, Result},
    ingress::InboundNotification,
    model::{SessionId, Task, TaskQueue},
    settings::Settings,
};

/// Request/response side of the server: reachability, notification
/// fallback, and whole-collection fetches for the task mirror.
pub trait PullBackend: Send + Sync + 'static {
    /// `true` when the health endpoint answers with a success status
    /// within the probe timeout.
    fn probe(&self) -> impl Future<Output = bool> + Send;

    fn list_notifications(
        &self,
        session: SessionId,
        read: Option<bool>,
    ) -> impl Future<Output = Result<Vec<InboundNotification>>> + Send;

    /// Fails with [`LiveError::NotFound`] when the server has no such record.
    fn mark_read(
        &self,
        notification_id: i64,
        user_id: i64,
    ) -> impl Future<Output = Result<()>> + Send;

    fn fetch_tasks(&self) -> impl Future<Output = Result<Vec<Task>>> + Send;

    fn fetch_queues(&self) -> impl Future<Output = Result<Vec<TaskQueue>>> + Send;

    fn fetch_queue(&self, queue_id: i64) -> impl Future<Output = Result<TaskQueue>> + Send;
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    health_url: String,
    probe_timeout: Duration,
}

impl ApiClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            health_url: settings.health_url(),
            probe_timeout: settings.probe_timeout(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let endpoint = self.endpoint(path);
        tracing::debug!(%endpoint, "GET");
        let response = self.http.get(&endpoint).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(LiveError::NotFound);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read response body>".to_string());
    Err(LiveError::Http {
        status: status.as_u16(),
        body: truncate_message(&body, ERROR_DETAIL_MAX_CHARS),
    })
}

impl PullBackend for ApiClient {
    async fn probe(&self) -> bool {
        let request = self.http.head(&self.health_url).timeout(self.probe_timeout);
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                tracing::debug!(status = status.as_u16(), "reachability probe answered");
                status.is_success()
            }
            Err(error) => {
                tracing::debug!(%error, "reachability probe failed");
                false
            }
        }
    }

    async fn list_notifications(
        &self,
        session: SessionId,
        read: Option<bool>,
    ) -> Result<Vec<InboundNotification>> {
        let mut path = format!("/notifications/user/{session}");
        if let Some(read) = read {
            path.push_str(&format!("?read={read}"));
        }
        let payload: Value = self.get_json(&path).await?;
        InboundNotification::batch_from_value(payload)
    }

    async fn mark_read(&self, notification_id: i64, user_id: i64) -> Result<()> {
        let endpoint = self.endpoint(&format!("/notifications/{notification_id}/read"));
        tracing::debug!(%endpoint, user_id, "POST");
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({ "userId": user_id }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn fetch_tasks(&self) -> Result<Vec<Task>> {
        self.get_json("/tasks").await
    }

    async fn fetch_queues(&self) -> Result<Vec<TaskQueue>> {
        self.get_json("/task-queues").await
    }

    async fn fetch_queue(&self, queue_id: i64) -> Result<TaskQueue> {
        self.get_json(&format!("/task-queues/{queue_id}")).await
    }
}
