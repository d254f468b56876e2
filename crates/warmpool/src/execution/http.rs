// HTTP client for a container execution REST API
//
// Endpoints (JSON bodies, camelCase):
//   POST {base}/clusters/{cluster}/tasks              -> {"handle": "..."}
//   GET  {base}/clusters/{cluster}/tasks/{task}       -> TaskDescription
//   POST {base}/clusters/{cluster}/tasks/{task}/stop  <- {"reason": "..."}
//   GET  {base}/network-interfaces/{id}               -> {"publicIp": "..."}
// A 4xx on start is a rejection; its body may carry {"failures": [...]}.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::service::*;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartTaskRequest<'a> {
    task_definition: &'a str,
    subnets: &'a [String],
    security_groups: &'a [String],
    assign_public_ip: bool,
}

#[derive(Deserialize)]
struct StartTaskResponse {
    handle: String,
}

#[derive(Deserialize, Default)]
struct FailureBody {
    #[serde(default)]
    failures: Vec<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct StopTaskRequest<'a> {
    reason: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceResponse {
    public_ip: Option<String>,
}

/// [`ExecutionService`] backed by the execution REST API
///
/// Every call targets the cluster given to [`HttpExecutionService::new`], so
/// workers are described and stopped in the cluster they were started in.
pub struct HttpExecutionService {
    base_url: String,
    cluster: String,
    http: reqwest::Client,
}

impl HttpExecutionService {
    pub fn new(base_url: &str, cluster: impl Into<String>) -> Result<Self, ExecutionError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExecutionError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            cluster: cluster.into(),
            http,
        })
    }

    fn tasks_url(&self) -> String {
        format!("{}/clusters/{}/tasks", self.base_url, self.cluster)
    }

    fn task_url(&self, handle: &ExternalHandle) -> String {
        format!("{}/{}", self.tasks_url(), handle.task_id())
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, ExecutionError> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(ExecutionError::NotFound(what.to_string()));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ExecutionError::Transport(e.to_string()))
    }
}

fn transport(e: reqwest::Error) -> ExecutionError {
    ExecutionError::Transport(e.to_string())
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    #[instrument(skip(self, spec), fields(cluster = %self.cluster))]
    async fn start(&self, spec: &LaunchSpec) -> Result<ExternalHandle, ExecutionError> {
        if spec.cluster != self.cluster {
            warn!(
                requested = %spec.cluster,
                "launch spec names another cluster; starting in the service's cluster"
            );
        }

        let response = self
            .http
            .post(self.tasks_url())
            .json(&StartTaskRequest {
                task_definition: &spec.task_definition,
                subnets: &spec.subnets,
                security_groups: &spec.security_groups,
                assign_public_ip: spec.assign_public_ip,
            })
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            let body: FailureBody = serde_json::from_str(&text).unwrap_or_default();
            let reason = if !body.failures.is_empty() {
                body.failures.join("; ")
            } else {
                body.message.unwrap_or(text)
            };
            return Err(ExecutionError::StartRejected(reason));
        }

        let started: StartTaskResponse = Self::decode(response, "cluster").await?;
        debug!(handle = %started.handle, "execution service accepted start");
        Ok(ExternalHandle::new(started.handle))
    }

    #[instrument(skip(self), fields(task = %handle.task_id()))]
    async fn stop(&self, handle: &ExternalHandle, reason: &str) -> Result<(), ExecutionError> {
        let url = format!("{}/stop", self.task_url(handle));
        let response = self
            .http
            .post(&url)
            .json(&StopTaskRequest { reason })
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ExecutionError::NotFound(handle.to_string()));
        }

        let message = response.text().await.unwrap_or_default();
        Err(ExecutionError::Api {
            status: status.as_u16(),
            message,
        })
    }

    #[instrument(skip(self), fields(task = %handle.task_id()))]
    async fn describe(&self, handle: &ExternalHandle) -> Result<TaskDescription, ExecutionError> {
        let response = self
            .http
            .get(self.task_url(handle))
            .send()
            .await
            .map_err(transport)?;

        Self::decode(response, handle.as_str()).await
    }

    #[instrument(skip(self))]
    async fn resolve_network_address(&self, interface: &str) -> Result<String, ExecutionError> {
        let url = format!("{}/network-interfaces/{}", self.base_url, interface);
        let response = self.http.get(&url).send().await.map_err(transport)?;

        let body: NetworkInterfaceResponse = Self::decode(response, interface).await?;
        body.public_ip
            .ok_or_else(|| ExecutionError::NotFound(format!("no public address on {interface}")))
    }
}
