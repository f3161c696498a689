//! 任务存储抽象层
//!
//! 定义统一的任务存取接口：按键原子的读-改-写，每次成功变更递增版本号。
//! Agent 与 Supervisor 对同一任务的并发写经由此接口串行化；生产部署可在
//! 同一 trait 之后接入带行锁或乐观版本的事务型存储。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::task::Task;
use crate::core::{OrchestratorError, Result};

/// 在存储写锁内执行的任务变更；返回 Err 时任务保持原样
pub type TaskMutation = Box<dyn FnOnce(&mut Task) -> Result<()> + Send>;

/// 任务存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 插入新任务
    async fn insert(&self, task: Task) -> Result<()>;

    /// 点查
    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// 全量列出（查询与就绪筛选在调度器内完成）
    async fn list(&self) -> Result<Vec<Task>>;

    /// 原子读-改-写
    ///
    /// `expected_version` 有值且与当前版本不符时返回 Conflict；
    /// 变更成功后版本号加一，返回更新后的任务。
    async fn update(
        &self,
        id: &str,
        expected_version: Option<u64>,
        mutate: TaskMutation,
    ) -> Result<Task>;
}

/// 内存任务存储
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<()> {
        self.tasks.write().await.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn update(
        &self,
        id: &str,
        expected_version: Option<u64>,
        mutate: TaskMutation,
    ) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))?;

        if let Some(expected) = expected_version {
            if expected != slot.version {
                return Err(OrchestratorError::Conflict {
                    task_id: id.to_string(),
                    expected,
                    actual: slot.version,
                });
            }
        }

        // 在副本上变更，失败时不留下半套写入
        let mut next = slot.clone();
        mutate(&mut next)?;
        next.version = slot.version + 1;
        *slot = next.clone();
        Ok(next)
    }
}

/// 创建任务存储
pub fn create_task_store() -> Arc<dyn TaskStore> {
    tracing::info!("Using in-memory task store");
    Arc::new(MemoryTaskStore::new())
}
