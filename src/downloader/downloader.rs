//! Downloader state machine
//!
//! Runs tasks through `AWAIT -> DOWNLOAD -> COMPLETED | FAIL`, with pause
//! and delete reachable while a task is not finished.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::repository::TaskRepository;
use super::task::{TaskEntity, TaskStatus};
use super::transfer::{Protocol, Transfer};
use crate::engine::events::EngineEvent;
use crate::engine::reactor::Shutdown;
use crate::engine::Engine;
use crate::error::TorrentError;

#[derive(Debug)]
pub struct Downloader {
    engine: Arc<Engine>,
    repository: Arc<TaskRepository>,
    /// One lock per task id; held for the whole run
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Stop signals of running tasks
    running: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl Downloader {
    pub fn new(engine: Arc<Engine>, repository: Arc<TaskRepository>) -> Self {
        Self {
            engine,
            repository,
            locks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<TaskRepository> {
        &self.repository
    }

    /// Create an AWAIT task for a `.torrent` path or magnet link
    pub async fn add(&self, url: &str, selection: Vec<String>) -> Result<TaskEntity> {
        let protocol = Protocol::detect(url)?;
        let mut task = TaskEntity::new(url, self.engine.config().download_dir.clone(), selection);
        task.name = protocol.display_name();
        self.repository.insert(task.clone()).await?;
        info!("Added task {} ({})", task.id, task.name);
        Ok(task)
    }

    /// Run an AWAIT task to its end state
    pub async fn run(&self, id: &str) -> Result<TaskStatus> {
        let task = self.repository.get(id).await?;
        let transfer = Protocol::detect(&task.url)?.transfer(Arc::clone(&self.engine), task);
        self.run_with(id, Box::new(transfer)).await
    }

    /// Run a task with an explicit transfer
    pub async fn run_with(&self, id: &str, transfer: Box<dyn Transfer>) -> Result<TaskStatus> {
        let lock = self.task_lock(id).await;
        let Ok(guard) = lock.try_lock() else {
            return Err(TorrentError::task_error("Task is already running", id).into());
        };
        let result = self.run_locked(id, transfer).await;
        drop(guard);
        self.forget_lock(id, &lock).await;
        result
    }

    async fn run_locked(&self, id: &str, mut transfer: Box<dyn Transfer>) -> Result<TaskStatus> {
        // registered before DOWNLOAD so a pause racing the start still reaches this run
        let (stop_tx, stop_rx) = watch::channel(false);
        self.running.lock().await.insert(id.to_string(), stop_tx);
        if let Err(e) = self.start(id).await {
            self.running.lock().await.remove(id);
            return Err(e);
        }

        let result = self.drive(id, transfer.as_mut(), Shutdown::from(stop_rx)).await;
        transfer.release().await;
        self.running.lock().await.remove(id);

        let current = self.repository.get(id).await?.status;
        if current != TaskStatus::Download {
            // paused or deleted while running
            debug!("Task {} left the run as {}", id, current);
            return Ok(current);
        }
        match result {
            Ok(true) => {
                self.set_status(id, TaskStatus::Completed).await?;
                self.engine.events().emit(EngineEvent::TaskCompleted { task_id: id.to_string() });
                info!("Task {} completed", id);
                Ok(TaskStatus::Completed)
            }
            Ok(false) => {
                self.set_status(id, TaskStatus::Pause).await?;
                self.set_status(id, TaskStatus::Await).await?;
                warn!("Task {} interrupted before completion", id);
                Ok(TaskStatus::Await)
            }
            Err(e) => {
                let cause = e.to_string();
                error!("Task {} failed: {}", id, cause);
                self.set_status(id, TaskStatus::Fail).await?;
                self.engine.events().emit(EngineEvent::TaskFailed {
                    task_id: id.to_string(),
                    cause,
                });
                Ok(TaskStatus::Fail)
            }
        }
    }

    /// AWAIT -> DOWNLOAD as one repository update
    async fn start(&self, id: &str) -> Result<()> {
        self.repository
            .update(id, |task| {
                if task.status != TaskStatus::Await {
                    return Err(TorrentError::validation_error_with_field(
                        format!("Task {} is {}, only AWAIT tasks run", task.id, task.status),
                        "status",
                    )
                    .into());
                }
                task.transition(TaskStatus::Download)
            })
            .await?;
        debug!("Task {} is now {}", id, TaskStatus::Download);
        self.engine.events().emit(EngineEvent::TaskStatusChanged {
            task_id: id.to_string(),
            status: TaskStatus::Download,
        });
        Ok(())
    }

    async fn drive(&self, id: &str, transfer: &mut dyn Transfer, stop: Shutdown) -> Result<bool> {
        if stop.is_triggered() {
            return Ok(false);
        }
        transfer.open().await?;
        if stop.is_triggered() {
            debug!("Task {} stopped while opening", id);
            return Ok(false);
        }
        let size = transfer.size();
        let name = transfer.name();
        self.repository
            .update(id, |task| {
                task.size = size;
                if let Some(name) = name {
                    task.name = name;
                }
                Ok(())
            })
            .await?;
        transfer.download(stop).await?;
        transfer.check_completed().await
    }

    async fn task_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Drop the map entry unless a newer lock replaced it
    async fn forget_lock(&self, id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        if locks.get(id).is_some_and(|current| Arc::ptr_eq(current, lock)) {
            locks.remove(id);
        }
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<TaskEntity> {
        let task = self.repository.update_status(id, status).await?;
        debug!("Task {} is now {}", id, status);
        self.engine.events().emit(EngineEvent::TaskStatusChanged {
            task_id: id.to_string(),
            status,
        });
        Ok(task)
    }

    async fn signal_stop(&self, id: &str) {
        if let Some(stop) = self.running.lock().await.get(id) {
            stop.send_replace(true);
        }
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.running.lock().await.contains_key(id)
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.set_status(id, TaskStatus::Pause).await?;
        self.signal_stop(id).await;
        Ok(())
    }

    /// Put a paused or failed task back to AWAIT
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.set_status(id, TaskStatus::Await).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.set_status(id, TaskStatus::Delete).await?;
        self.signal_stop(id).await;
        // a running task drops its own entry when the run ends
        let mut locks = self.locks.lock().await;
        if locks.get(id).is_some_and(|lock| lock.try_lock().is_ok()) {
            locks.remove(id);
        }
        Ok(())
    }
}
