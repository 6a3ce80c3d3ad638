// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP adapter for the hosted container platform's task-run API.

use std::collections::HashMap;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::platform::{ContainerPlatform, RunningTask, TaskHandle, TaskSpec};

/// HTTP client wrapper for the platform's REST surface.
pub struct HttpPlatform {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct RunTaskRequest<'a> {
    env: &'a HashMap<String, String>,
    tags: HashMap<&'static str, &'a str>,
}

#[derive(Debug, Deserialize)]
struct RunTaskResponse {
    task_id: String,
}

#[derive(Debug, Serialize)]
struct StopTaskRequest<'a> {
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListTasksResponse {
    tasks: Vec<TaskListing>,
}

#[derive(Debug, Deserialize)]
struct TaskListing {
    task_id: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl HttpPlatform {
    pub fn new(base_url: String, auth_token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { base_url: base_url.trim_end_matches('/').to_owned(), auth_token, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl ContainerPlatform for HttpPlatform {
    async fn run_task(&self, spec: TaskSpec) -> anyhow::Result<TaskHandle> {
        let mut tags = HashMap::new();
        tags.insert("session_id", spec.session_id.as_str());
        tags.insert("project_id", spec.project_id.as_str());

        let body = RunTaskRequest { env: &spec.env, tags };
        let req = self.client.post(self.url("/v1/tasks")).json(&body);
        let resp = self.apply_auth(req).send().await?.error_for_status()?;
        let parsed: RunTaskResponse = resp.json().await?;
        Ok(TaskHandle { task_id: parsed.task_id })
    }

    async fn stop_task(&self, task_id: &str, reason: &str) -> anyhow::Result<()> {
        let req = self
            .client
            .post(self.url(&format!("/v1/tasks/{task_id}/stop")))
            .json(&StopTaskRequest { reason });
        let resp = self.apply_auth(req).send().await?;
        // 404 means the task already exited; stop is best-effort.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn list_tasks(&self) -> anyhow::Result<Vec<RunningTask>> {
        let req = self.client.get(self.url("/v1/tasks"));
        let resp = self.apply_auth(req).send().await?.error_for_status()?;
        let parsed: ListTasksResponse = resp.json().await?;
        Ok(parsed
            .tasks
            .into_iter()
            .map(|t| RunningTask {
                task_id: t.task_id,
                session_id: t.tags.get("session_id").cloned(),
            })
            .collect())
    }
}
