//! 持久优先级任务队列
//!
//! 调度核心的叶子组件：持有任务记录、队列排序、重试簿记与统计。
//! 派发候选只来自 pending / scheduled 两个状态；failed → scheduled 的重试
//! 迁移由指数退避（含抖动、封顶）控制节奏。

use std::collections::HashMap;
use std::sync::Arc;

use super::store::TaskStore;
use super::task::{
    now_ms, Task, TaskParams, TaskPatch, TaskQuery, TaskStats, TaskStatus,
};
use crate::core::{OrchestratorError, Result};

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 任务未指定时的重试上限
    pub default_max_retries: u32,
    /// 退避基准延迟（毫秒）
    pub base_retry_delay_ms: u64,
    /// 退避延迟封顶（毫秒）
    pub max_retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
        }
    }
}

/// 重试延迟 = min(2^attempt * base * (1 + jitter), cap)，jitter ∈ [0, 0.3)
///
/// 抖动取自亚秒时钟，避免同一批失败任务在同一毫秒齐发重试。
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exp = 2u64.saturating_pow(attempt.min(32));
    let jitter = f64::from(chrono::Utc::now().timestamp_subsec_millis() % 300) / 1000.0;
    let delay = exp.saturating_mul(base_ms) as f64 * (1.0 + jitter);
    (delay as u64).min(cap_ms)
}

/// 任务调度器
pub struct TaskScheduler {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn TaskStore>) -> Self {
        Self { config, store }
    }

    /// 创建新任务并入队（pending）
    pub async fn schedule_task(&self, params: TaskParams) -> Result<Task> {
        let task = Task {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            experiment_run_id: params.experiment_run_id,
            campaign_id: params.campaign_id,
            controller_id: params.controller_id,
            activity_name: params.activity_name,
            activity_options: params.activity_options,
            status: TaskStatus::Pending,
            priority: params.priority,
            retry_count: 0,
            max_retries: params.max_retries.unwrap_or(self.config.default_max_retries),
            created_at: now_ms(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            last_attempt: None,
            next_retry: None,
            deadline: params.deadline,
            activity_id: None,
            error: None,
            metadata: params.metadata,
            version: 0,
        };

        self.store.insert(task.clone()).await?;
        tracing::debug!(
            "Task {} queued: {} on {} ({:?})",
            task.id,
            task.activity_name,
            task.controller_id,
            task.priority
        );
        Ok(task)
    }

    /// 点查，未知 ID 返回 TaskNotFound
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))
    }

    /// 部分更新；已完成的任务不可变，过期版本返回 Conflict
    pub async fn update_task(
        &self,
        id: &str,
        patch: TaskPatch,
        expected_version: Option<u64>,
    ) -> Result<Task> {
        self.store
            .update(
                id,
                expected_version,
                Box::new(move |task| {
                    if task.status == TaskStatus::Completed {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "update",
                        });
                    }
                    if let Some(priority) = patch.priority {
                        task.priority = priority;
                    }
                    if let Some(max_retries) = patch.max_retries {
                        // retry_count <= max_retries 恒成立
                        task.max_retries = max_retries.max(task.retry_count);
                    }
                    if let Some(deadline) = patch.deadline {
                        task.deadline = Some(deadline);
                    }
                    if let Some(metadata) = patch.metadata {
                        task.metadata = Some(metadata);
                    }
                    if let Some(error) = patch.error {
                        task.error = Some(error);
                    }
                    Ok(())
                }),
            )
            .await
    }

    /// 取消任务；已完成的任务拒绝取消
    pub async fn cancel_task(&self, id: &str, reason: &str) -> Result<Task> {
        let reason = reason.to_string();
        self.store
            .update(
                id,
                None,
                Box::new(move |task| {
                    if task.status == TaskStatus::Completed {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "cancel",
                        });
                    }
                    task.status = TaskStatus::Cancelled;
                    task.error = Some(reason);
                    task.completed_at = Some(now_ms());
                    task.next_retry = None;
                    Ok(())
                }),
            )
            .await
    }

    /// 就绪任务：pending/scheduled、重试时间已到、未过截止时间；
    /// critical 优先，同优先级内 FIFO；最多返回 limit 条。
    pub async fn get_ready_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let now = now_ms();
        let mut ready: Vec<Task> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::Scheduled)
                    && t.next_retry.map_or(true, |at| at <= now)
                    && t.deadline.map_or(true, |at| at >= now)
            })
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_at().cmp(&b.queued_at()))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    /// 下一个待派发的任务
    pub async fn get_next_task(&self) -> Result<Option<Task>> {
        Ok(self.get_ready_tasks(1).await?.into_iter().next())
    }

    /// 条件查询，按 created_at 倒序，offset/limit 分页
    pub async fn query_tasks(&self, query: TaskQuery) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| {
                query
                    .status
                    .as_ref()
                    .map_or(true, |set| set.contains(&t.status))
                    && query
                        .experiment_run_id
                        .as_ref()
                        .map_or(true, |id| &t.experiment_run_id == id)
                    && query
                        .campaign_id
                        .as_ref()
                        .map_or(true, |id| t.campaign_id.as_ref() == Some(id))
                    && query
                        .controller_id
                        .as_ref()
                        .map_or(true, |id| &t.controller_id == id)
                    && query.priority.map_or(true, |p| t.priority == p)
            })
            .collect();

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let tasks = tasks
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(tasks)
    }

    /// 统计：各状态计数、平均完成耗时、平均重试次数
    pub async fn task_stats(&self) -> Result<TaskStats> {
        let tasks = self.store.list().await?;

        let mut by_status: HashMap<String, usize> = HashMap::new();
        for task in &tasks {
            *by_status.entry(task.status.to_string()).or_default() += 1;
        }

        let completions: Vec<i64> = tasks
            .iter()
            .filter_map(|t| match (t.started_at, t.completed_at) {
                (Some(start), Some(end)) => Some(end - start),
                _ => None,
            })
            .collect();
        let avg_completion_ms = if completions.is_empty() {
            None
        } else {
            Some(completions.iter().sum::<i64>() as f64 / completions.len() as f64)
        };

        let retried: Vec<u32> = tasks
            .iter()
            .filter(|t| t.retry_count > 0)
            .map(|t| t.retry_count)
            .collect();
        let avg_retries = if retried.is_empty() {
            None
        } else {
            Some(retried.iter().map(|&n| f64::from(n)).sum::<f64>() / retried.len() as f64)
        };

        Ok(TaskStats {
            total: tasks.len(),
            by_status,
            avg_completion_ms,
            avg_retries,
        })
    }

    /// 派发成功：running + 记录活动 ID
    pub async fn mark_started(&self, id: &str, activity_id: &str) -> Result<Task> {
        let activity_id = activity_id.to_string();
        self.store
            .update(
                id,
                None,
                Box::new(move |task| {
                    if !matches!(task.status, TaskStatus::Pending | TaskStatus::Scheduled) {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "mark started",
                        });
                    }
                    let now = now_ms();
                    task.status = TaskStatus::Running;
                    task.activity_id = Some(activity_id);
                    task.started_at = Some(now);
                    task.last_attempt = Some(now);
                    task.next_retry = None;
                    Ok(())
                }),
            )
            .await
    }

    /// 执行成功，此后任务不可变
    pub async fn mark_completed(&self, id: &str) -> Result<Task> {
        self.store
            .update(
                id,
                None,
                Box::new(|task| {
                    if task.status != TaskStatus::Running {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "mark completed",
                        });
                    }
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(now_ms());
                    Ok(())
                }),
            )
            .await
    }

    /// 执行失败。不写 completed_at：失败的任务可能还会被重试
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<Task> {
        let error = error.to_string();
        self.store
            .update(
                id,
                None,
                Box::new(move |task| {
                    if task.status.is_terminal() {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "mark failed",
                        });
                    }
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                    task.last_attempt = Some(now_ms());
                    task.next_retry = None;
                    Ok(())
                }),
            )
            .await
    }

    /// Supervisor 的强制超时迁移，仅对 running 生效
    pub async fn mark_timeout(&self, id: &str, error: &str) -> Result<Task> {
        let error = error.to_string();
        self.store
            .update(
                id,
                None,
                Box::new(move |task| {
                    if task.status != TaskStatus::Running {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "mark timeout",
                        });
                    }
                    task.status = TaskStatus::Timeout;
                    task.error = Some(error);
                    task.completed_at = Some(now_ms());
                    task.next_retry = None;
                    Ok(())
                }),
            )
            .await
    }

    /// 刷新 running 任务的 last_attempt（陈旧核对后控制器仍在执行）
    pub async fn refresh_last_attempt(&self, id: &str) -> Result<Task> {
        self.store
            .update(
                id,
                None,
                Box::new(|task| {
                    if task.status != TaskStatus::Running {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "refresh last attempt",
                        });
                    }
                    task.last_attempt = Some(now_ms());
                    Ok(())
                }),
            )
            .await
    }

    /// 安排一次重试
    ///
    /// 重试次数已达上限时返回 None；否则 retry_count 加一、按退避延迟进入
    /// scheduled 并清除错误。带版本 CAS：与并发写冲突时返回 Conflict。
    pub async fn schedule_retry(&self, id: &str) -> Result<Option<Task>> {
        let task = self.get_task(id).await?;
        if task.retry_count >= task.max_retries {
            return Ok(None);
        }

        let base = self.config.base_retry_delay_ms;
        let cap = self.config.max_retry_delay_ms;
        let updated = self
            .store
            .update(
                id,
                Some(task.version),
                Box::new(move |task| {
                    if task.status == TaskStatus::Completed {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "schedule retry",
                        });
                    }
                    let now = now_ms();
                    task.retry_count += 1;
                    let delay = backoff_delay_ms(task.retry_count, base, cap);
                    task.status = TaskStatus::Scheduled;
                    task.scheduled_at = Some(now);
                    task.next_retry = Some(now + delay as i64);
                    task.error = None;
                    Ok(())
                }),
            )
            .await?;

        tracing::debug!(
            "Task {} retry {}/{} scheduled at {:?}",
            updated.id,
            updated.retry_count,
            updated.max_retries,
            updated.next_retry
        );
        Ok(Some(updated))
    }

    /// 操作员逃生通道：绕过重试策略，把任务重置回 pending 并清零重试计数。
    /// 已完成的任务仍然不可变。
    pub async fn force_retry(&self, id: &str) -> Result<Task> {
        self.store
            .update(
                id,
                None,
                Box::new(|task| {
                    if task.status == TaskStatus::Completed {
                        return Err(OrchestratorError::InvalidState {
                            task_id: task.id.clone(),
                            status: task.status,
                            operation: "force retry",
                        });
                    }
                    task.status = TaskStatus::Pending;
                    task.retry_count = 0;
                    task.error = None;
                    task.next_retry = None;
                    task.scheduled_at = None;
                    task.activity_id = None;
                    task.completed_at = None;
                    Ok(())
                }),
            )
            .await
    }
}
