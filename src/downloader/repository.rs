//! Task repository
//!
//! Every task lives in one JSON file; each mutation rewrites it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::task::{TaskEntity, TaskStatus};
use crate::error::TorrentError;

#[derive(Debug)]
pub struct TaskRepository {
    path: PathBuf,
    tasks: RwLock<BTreeMap<String, TaskEntity>>,
}

impl TaskRepository {
    /// Open the repository at `path`; a missing file means no tasks yet
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tasks: BTreeMap<String, TaskEntity> = match fs::read(&path).await {
            Ok(data) => {
                let list: Vec<TaskEntity> = serde_json::from_slice(&data)?;
                list.into_iter().map(|t| (t.id.clone(), t)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(TorrentError::storage_error_full(
                    "Failed to read task file",
                    path.display().to_string(),
                    e.to_string(),
                )
                .into())
            }
        };
        info!("Loaded {} tasks from {}", tasks.len(), path.display());
        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, tasks: &BTreeMap<String, TaskEntity>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let list: Vec<&TaskEntity> = tasks.values().collect();
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&list)?).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!("Persisted {} tasks", list.len());
        Ok(())
    }

    pub async fn insert(&self, task: TaskEntity) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task);
        self.persist(&tasks).await
    }

    pub async fn get(&self, id: &str) -> Result<TaskEntity> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TorrentError::task_error("Unknown task", id).into())
    }

    pub async fn list(&self) -> Vec<TaskEntity> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Apply a status transition and persist it
    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<TaskEntity> {
        self.update(id, |task| task.transition(status)).await
    }

    /// Mutate a task in place; nothing is persisted when `f` fails
    pub async fn update<F>(&self, id: &str, f: F) -> Result<TaskEntity>
    where
        F: FnOnce(&mut TaskEntity) -> Result<()>,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TorrentError::task_error("Unknown task", id))?;
        let mut updated = task.clone();
        f(&mut updated)?;
        *task = updated.clone();
        self.persist(&tasks).await?;
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> Result<Option<TaskEntity>> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks.remove(id);
        if removed.is_some() {
            self.persist(&tasks).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/tasks.json");
        let repo = TaskRepository::load(&path).await.unwrap();
        assert!(repo.list().await.is_empty());

        let task = TaskEntity::new("a.torrent", dir.path(), vec![]);
        let id = task.id.clone();
        repo.insert(task).await.unwrap();
        repo.update_status(&id, TaskStatus::Download).await.unwrap();

        let reloaded = TaskRepository::load(&path).await.unwrap();
        assert_eq!(reloaded.get(&id).await.unwrap().status, TaskStatus::Download);
        assert_eq!(reloaded.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_rejected_transition_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = TaskRepository::load(dir.path().join("tasks.json")).await.unwrap();
        let task = TaskEntity::new("a.torrent", dir.path(), vec![]);
        let id = task.id.clone();
        repo.insert(task).await.unwrap();

        assert!(repo.update_status(&id, TaskStatus::Completed).await.is_err());
        assert_eq!(repo.get(&id).await.unwrap().status, TaskStatus::Await);
        assert!(repo.get("missing").await.is_err());
        assert!(repo.remove(&id).await.unwrap().is_some());
        assert!(repo.remove(&id).await.unwrap().is_none());
    }
}
