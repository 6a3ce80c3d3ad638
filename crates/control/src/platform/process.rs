// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local process launcher: runs each "container" as a detached child process
//! via a configured shell command template.
//!
//! Used for development and the test stack. Lifecycle events that the hosted
//! platform would ship over the bus are synthesized here: PROVISIONING and
//! RUNNING at spawn time, STOPPED (with the exit code) from the reaper.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::platform::{
    ContainerPlatform, LifecycleEvent, LifecyclePhase, RunningTask, TaskHandle, TaskSpec,
};

struct TrackedTask {
    session_id: String,
    child: Child,
}

/// Spawns session containers as local child processes.
pub struct ProcessPlatform {
    launch_template: String,
    /// Address clients reach the local proxy on, e.g. `127.0.0.1:9223`.
    public_address: String,
    events: mpsc::Sender<LifecycleEvent>,
    tasks: Arc<Mutex<HashMap<String, TrackedTask>>>,
}

impl ProcessPlatform {
    pub fn new(
        launch_template: String,
        public_address: String,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            launch_template,
            public_address,
            events,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the reaper that turns child exits into STOPPED lifecycle events.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) {
        let tasks = Arc::clone(&self.tasks);
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(std::time::Duration::from_secs(2));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }

                let mut exited = Vec::new();
                {
                    let mut guard = tasks.lock().await;
                    for (task_id, tracked) in guard.iter_mut() {
                        if let Ok(Some(status)) = tracked.child.try_wait() {
                            exited.push((
                                task_id.clone(),
                                tracked.session_id.clone(),
                                status.code(),
                            ));
                        }
                    }
                    for (task_id, _, _) in &exited {
                        guard.remove(task_id);
                    }
                }

                for (task_id, session_id, code) in exited {
                    tracing::info!(task_id = %task_id, session_id = %session_id, exit_code = ?code, "local task exited");
                    let _ = events
                        .send(LifecycleEvent {
                            task_id,
                            session_id,
                            phase: LifecyclePhase::Stopped,
                            reason: code.map(|c| format!("container_exit_{c}")),
                            public_address: None,
                            exit_code: code,
                        })
                        .await;
                }
            }
        });
    }

    async fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event).await;
    }
}

#[async_trait::async_trait]
impl ContainerPlatform for ProcessPlatform {
    async fn run_task(&self, spec: TaskSpec) -> anyhow::Result<TaskHandle> {
        let task_id = format!("task_{}", uuid::Uuid::new_v4());

        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", &self.launch_template]);

        // The coordinator composes the full env and has already filtered
        // user-supplied extras against the reserved keys.
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("TASK_ID", &task_id);

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::inherit());
        cmd.stderr(std::process::Stdio::inherit());
        // Detach into a new process group so containers survive control-plane restart.
        cmd.process_group(0);

        let child = cmd.spawn()?;
        self.tasks.lock().await.insert(
            task_id.clone(),
            TrackedTask { session_id: spec.session_id.clone(), child },
        );

        self.emit(LifecycleEvent {
            task_id: task_id.clone(),
            session_id: spec.session_id.clone(),
            phase: LifecyclePhase::Provisioning,
            reason: None,
            public_address: None,
            exit_code: None,
        })
        .await;
        self.emit(LifecycleEvent {
            task_id: task_id.clone(),
            session_id: spec.session_id,
            phase: LifecyclePhase::Running,
            reason: None,
            public_address: Some(self.public_address.clone()),
            exit_code: None,
        })
        .await;

        Ok(TaskHandle { task_id })
    }

    async fn stop_task(&self, task_id: &str, reason: &str) -> anyhow::Result<()> {
        let mut guard = self.tasks.lock().await;
        if let Some(tracked) = guard.get_mut(task_id) {
            tracing::info!(task_id, reason, "stopping local task");
            tracked.child.start_kill()?;
        }
        Ok(())
    }

    async fn list_tasks(&self) -> anyhow::Result<Vec<RunningTask>> {
        let guard = self.tasks.lock().await;
        Ok(guard
            .iter()
            .map(|(task_id, tracked)| RunningTask {
                task_id: task_id.clone(),
                session_id: Some(tracked.session_id.clone()),
            })
            .collect())
    }
}
