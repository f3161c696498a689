//! 监督器：周期对账与策略执行
//!
//! 独立于 Agent 的事件路径运行。两个定时器（启动时各立即触发一次）：
//! 监控定时器并发执行陈旧核对、超时强制与失败处理；健康定时器巡检控制器。
//! Agent 漏掉的任务、超出策略上限的任务都在这里被纠正或升级。

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::escalation::{EscalationEvent, EscalationHandler, EscalationKind};
use super::health::{ControllerHealthState, HealthTracker};
use crate::gateway::{ActivityStatus, CorrelationStore, InstrumentGateway};
use crate::scheduler::{now_ms, Task, TaskQuery, TaskScheduler, TaskStatus};

/// 监督器配置
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// 监控周期（毫秒）
    pub monitor_interval_ms: u64,
    /// running 任务多久没有更新算陈旧（触发对账，不是失败）
    pub stale_threshold_ms: u64,
    /// 自开始起的绝对墙钟上限（触发强制取消）
    pub activity_timeout_ms: u64,
    /// 是否自动重试失败任务
    pub auto_retry_enabled: bool,
    /// 是否投递升级事件
    pub escalation_enabled: bool,
    /// 健康巡检周期（毫秒）
    pub health_check_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 10_000,
            stale_threshold_ms: 30_000,
            activity_timeout_ms: 300_000,
            auto_retry_enabled: true,
            escalation_enabled: true,
            health_check_interval_ms: 30_000,
        }
    }
}

/// 错误文本中出现这些标记的失败不可重试，直接升级
pub const NON_RETRYABLE_MARKERS: [&str; 4] = [
    "invalid_options",
    "unknown_activity",
    "authorization_failed",
    "resource_not_found",
];

/// 重试判定：次数未耗尽、未过截止时间、错误不含不可重试标记
pub fn should_retry(task: &Task, now: i64) -> bool {
    if task.retry_count >= task.max_retries {
        return false;
    }
    if let Some(deadline) = task.deadline {
        if deadline < now {
            return false;
        }
    }
    if let Some(error) = &task.error {
        if NON_RETRYABLE_MARKERS.iter().any(|m| error.contains(m)) {
            return false;
        }
    }
    true
}

/// 连续失败达到该值视为控制器离线
const OFFLINE_THRESHOLD: u32 = 3;

/// 指标快照
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorMetrics {
    pub checks_performed: u64,
    pub stale_activities_detected: u64,
    pub timeouts_enforced: u64,
    pub retries_scheduled: u64,
    pub failures_escalated: u64,
    pub health_checks_performed: u64,
    pub controllers_online: usize,
    pub controllers_offline: usize,
    pub last_check_time: Option<i64>,
}

#[derive(Default)]
struct SupervisorStats {
    checks_performed: AtomicU64,
    stale_activities_detected: AtomicU64,
    timeouts_enforced: AtomicU64,
    retries_scheduled: AtomicU64,
    failures_escalated: AtomicU64,
    health_checks_performed: AtomicU64,
    controllers_online: AtomicUsize,
    controllers_offline: AtomicUsize,
    last_check_time: AtomicI64,
}

/// 任务监督器
pub struct TaskSupervisor {
    config: SupervisorConfig,
    scheduler: Arc<TaskScheduler>,
    gateway: Arc<dyn InstrumentGateway>,
    correlations: Arc<dyn CorrelationStore>,
    handlers: RwLock<Vec<Arc<dyn EscalationHandler>>>,
    health: HealthTracker,
    /// 已为失败升级过的任务，避免每个监控周期重复轰炸处理器
    escalated: RwLock<HashSet<String>>,
    stats: SupervisorStats,
    cancel: Mutex<Option<CancellationToken>>,
}

impl TaskSupervisor {
    pub fn new(
        config: SupervisorConfig,
        scheduler: Arc<TaskScheduler>,
        gateway: Arc<dyn InstrumentGateway>,
        correlations: Arc<dyn CorrelationStore>,
    ) -> Self {
        Self {
            config,
            scheduler,
            gateway,
            correlations,
            handlers: RwLock::new(Vec::new()),
            health: HealthTracker::new(),
            escalated: RwLock::new(HashSet::new()),
            stats: SupervisorStats::default(),
            cancel: Mutex::new(None),
        }
    }

    /// 注册升级处理器
    pub async fn add_handler(&self, handler: Arc<dyn EscalationHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// 启动两个监控循环，各自立即触发首轮。重复调用无效果。
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.cancel.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        info!(
            "Supervisor starting (monitor={}ms, health={}ms)",
            self.config.monitor_interval_ms, self.config.health_check_interval_ms
        );

        let supervisor = Arc::clone(self);
        let monitor_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                supervisor.config.monitor_interval_ms.max(1),
            ));
            loop {
                tokio::select! {
                    _ = monitor_token.cancelled() => break,
                    _ = ticker.tick() => supervisor.run_monitor_cycle().await,
                }
            }
            debug!("Supervisor monitor loop exited");
        });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                supervisor.config.health_check_interval_ms.max(1),
            ));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => supervisor.run_health_checks().await,
                }
            }
            debug!("Supervisor health loop exited");
        });
    }

    /// 停止两个循环。重复调用无效果。
    pub async fn stop(&self) {
        let mut guard = self.cancel.lock().await;
        if let Some(token) = guard.take() {
            token.cancel();
            info!("Supervisor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.cancel.lock().await.is_some()
    }

    /// 一个监控周期：三项检查并发执行，互不等待
    pub async fn run_monitor_cycle(&self) {
        self.stats.checks_performed.fetch_add(1, Ordering::Relaxed);
        self.stats.last_check_time.store(now_ms(), Ordering::Relaxed);

        tokio::join!(
            self.check_stale_activities(),
            self.check_timeouts(),
            self.process_failed_tasks(),
        );
    }

    /// 陈旧核对：长时间没有更新的 running 任务向控制器问真相。
    /// 已完成 → 迟到收尾；失败/取消 → 记失败；仍在跑 → 刷新心跳。
    async fn check_stale_activities(&self) {
        let now = now_ms();
        let threshold = self.config.stale_threshold_ms as i64;
        let running = match self.scheduler.query_tasks(TaskQuery::by_status(TaskStatus::Running)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Stale check query failed: {}", e);
                return;
            }
        };

        for task in running {
            let last = task
                .last_attempt
                .or(task.started_at)
                .unwrap_or(task.created_at);
            if now - last < threshold {
                continue;
            }
            self.stats
                .stale_activities_detected
                .fetch_add(1, Ordering::Relaxed);

            let Some(activity_id) = task.activity_id.clone() else {
                warn!("Running task {} has no activity id", task.id);
                let _ = self
                    .scheduler
                    .mark_failed(&task.id, "running task lost its activity id")
                    .await;
                continue;
            };

            match self
                .gateway
                .activity_status(&task.controller_id, &activity_id)
                .await
            {
                Ok(report) => match report.status {
                    ActivityStatus::Completed => {
                        info!("Late completion reconciled for task {}", task.id);
                        if self.scheduler.mark_completed(&task.id).await.is_ok() {
                            let _ = self
                                .correlations
                                .update_status(&activity_id, TaskStatus::Completed)
                                .await;
                        }
                    }
                    ActivityStatus::Failed | ActivityStatus::Cancelled => {
                        let reason = report
                            .message
                            .unwrap_or_else(|| format!("controller reported {}", report.status));
                        if self.scheduler.mark_failed(&task.id, &reason).await.is_ok() {
                            let status = if report.status == ActivityStatus::Cancelled {
                                TaskStatus::Cancelled
                            } else {
                                TaskStatus::Failed
                            };
                            let _ = self.correlations.update_status(&activity_id, status).await;
                        }
                    }
                    _ => {
                        // 控制器还在执行，刷新心跳等下一轮
                        let _ = self.scheduler.refresh_last_attempt(&task.id).await;
                    }
                },
                Err(e) => {
                    let reason = format!("status query failed: {}", e);
                    warn!("Stale probe for task {} failed: {}", task.id, e);
                    if self.scheduler.mark_failed(&task.id, &reason).await.is_ok() {
                        let _ = self
                            .correlations
                            .update_status(&activity_id, TaskStatus::Failed)
                            .await;
                    }
                }
            }
        }
    }

    /// 超时强制：超过绝对墙钟上限的 running 任务被要求取消并迁入 timeout
    async fn check_timeouts(&self) {
        let now = now_ms();
        let limit = self.config.activity_timeout_ms as i64;
        let running = match self.scheduler.query_tasks(TaskQuery::by_status(TaskStatus::Running)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Timeout check query failed: {}", e);
                return;
            }
        };

        for task in running {
            let Some(started_at) = task.started_at else {
                continue;
            };
            if now - started_at <= limit {
                continue;
            }

            if let Some(activity_id) = &task.activity_id {
                if let Err(e) = self
                    .gateway
                    .cancel_activity(&task.controller_id, activity_id, "Timeout exceeded")
                    .await
                {
                    warn!("Cancel request for activity {} failed: {}", activity_id, e);
                }
                let _ = self
                    .correlations
                    .update_status(activity_id, TaskStatus::Cancelled)
                    .await;
            }

            let reason = format!(
                "activity exceeded {}ms timeout",
                self.config.activity_timeout_ms
            );
            match self.scheduler.mark_timeout(&task.id, &reason).await {
                Ok(timed_out) => {
                    self.stats.timeouts_enforced.fetch_add(1, Ordering::Relaxed);
                    warn!("Task {} timed out after {}ms", timed_out.id, now - started_at);
                    self.escalate(EscalationEvent::for_task(
                        EscalationKind::ActivityTimeout,
                        &timed_out,
                    ))
                    .await;
                }
                Err(e) => {
                    // 与 Agent 的完成路径撞上了，让先到者生效
                    debug!("Timeout transition for {} superseded: {}", task.id, e);
                }
            }
        }
    }

    /// 失败处理：可重试的安排退避重试，不可重试的升级
    async fn process_failed_tasks(&self) {
        if !self.config.auto_retry_enabled {
            return;
        }
        let now = now_ms();
        let failed = match self.scheduler.query_tasks(TaskQuery::by_status(TaskStatus::Failed)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Failed-task query failed: {}", e);
                return;
            }
        };

        for task in failed {
            if should_retry(&task, now) {
                match self.scheduler.schedule_retry(&task.id).await {
                    Ok(Some(retried)) => {
                        self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                        self.escalated.write().await.remove(&task.id);
                        debug!(
                            "Retry {}/{} scheduled for task {}",
                            retried.retry_count, retried.max_retries, retried.id
                        );
                    }
                    Ok(None) => {
                        debug!("Retry budget for task {} exhausted under race", task.id);
                    }
                    Err(e) => {
                        warn!("Retry scheduling for task {} failed: {}", task.id, e);
                    }
                }
            } else {
                // 同一个失败只升级一次
                if !self.escalated.write().await.insert(task.id.clone()) {
                    continue;
                }
                let kind = if task.retry_count >= task.max_retries {
                    EscalationKind::RepeatedFailures
                } else {
                    EscalationKind::TaskFailed
                };
                self.escalate(EscalationEvent::for_task(kind, &task)).await;
            }
        }
    }

    /// 健康巡检：逐控制器查询，连续失败达到阈值则升级 controller_offline
    pub async fn run_health_checks(&self) {
        self.stats
            .health_checks_performed
            .fetch_add(1, Ordering::Relaxed);

        let controllers = match self.gateway.list_controllers().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Controller listing failed: {}", e);
                return;
            }
        };

        for info in controllers {
            let outcome = self.gateway.controller_health(&info.controller_id).await;
            let failure = match outcome {
                Ok(health) if health.healthy => {
                    self.health.record_success(&info.controller_id).await;
                    None
                }
                Ok(health) => Some(
                    health
                        .message
                        .unwrap_or_else(|| "controller reported unhealthy".to_string()),
                ),
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = failure {
                let failures = self
                    .health
                    .record_failure(&info.controller_id, reason.clone())
                    .await;
                if failures >= OFFLINE_THRESHOLD {
                    warn!(
                        "Controller {} offline ({} consecutive failures)",
                        info.controller_id, failures
                    );
                    self.escalate(
                        EscalationEvent::new(EscalationKind::ControllerOffline)
                            .with_controller(info.controller_id.clone())
                            .with_error(reason),
                    )
                    .await;
                }
            }
        }

        let (online, offline) = self.health.counts().await;
        self.stats.controllers_online.store(online, Ordering::Relaxed);
        self.stats.controllers_offline.store(offline, Ordering::Relaxed);
    }

    /// 投递升级事件。禁用时为空操作；处理器按注册顺序依次调用，
    /// 单个处理器的错误被捕获记日志，不阻断其余投递，也不中断监控周期。
    pub async fn escalate(&self, event: EscalationEvent) {
        if !self.config.escalation_enabled {
            return;
        }
        self.stats.failures_escalated.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Escalation {}: task={:?} controller={:?} error={:?}",
            event.kind, event.task_id, event.controller_id, event.error
        );

        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                error!("Escalation handler failed: {}", e);
            }
        }
    }

    /// 操作员逃生通道：绕过重试判定，把任务重置回 pending 并清零重试计数
    pub async fn force_retry(&self, task_id: &str) -> crate::core::Result<Task> {
        let task = self.scheduler.force_retry(task_id).await?;
        self.escalated.write().await.remove(task_id);
        info!("Task {} force-retried by operator", task_id);
        Ok(task)
    }

    /// 取消一个实验运行的全部 pending/scheduled 任务，返回取消数量。
    /// 单个任务的取消失败只记日志。
    pub async fn cancel_all_pending(&self, experiment_run_id: &str, reason: &str) -> usize {
        let pending = match self
            .scheduler
            .query_tasks(TaskQuery {
                status: Some(vec![TaskStatus::Pending, TaskStatus::Scheduled]),
                experiment_run_id: Some(experiment_run_id.to_string()),
                ..TaskQuery::default()
            })
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Pending query for run {} failed: {}", experiment_run_id, e);
                return 0;
            }
        };

        let mut cancelled = 0;
        for task in pending {
            match self.scheduler.cancel_task(&task.id, reason).await {
                Ok(_) => cancelled += 1,
                Err(e) => warn!("Cancel of task {} failed: {}", task.id, e),
            }
        }
        info!(
            "Cancelled {} pending tasks for run {}",
            cancelled, experiment_run_id
        );
        cancelled
    }

    /// 指标快照
    pub fn metrics(&self) -> SupervisorMetrics {
        let last = self.stats.last_check_time.load(Ordering::Relaxed);
        SupervisorMetrics {
            checks_performed: self.stats.checks_performed.load(Ordering::Relaxed),
            stale_activities_detected: self
                .stats
                .stale_activities_detected
                .load(Ordering::Relaxed),
            timeouts_enforced: self.stats.timeouts_enforced.load(Ordering::Relaxed),
            retries_scheduled: self.stats.retries_scheduled.load(Ordering::Relaxed),
            failures_escalated: self.stats.failures_escalated.load(Ordering::Relaxed),
            health_checks_performed: self
                .stats
                .health_checks_performed
                .load(Ordering::Relaxed),
            controllers_online: self.stats.controllers_online.load(Ordering::Relaxed),
            controllers_offline: self.stats.controllers_offline.load(Ordering::Relaxed),
            last_check_time: (last > 0).then_some(last),
        }
    }

    /// 控制器健康快照（防御性拷贝）
    pub async fn controller_health(&self) -> std::collections::HashMap<String, ControllerHealthState> {
        self.health.snapshot().await
    }
}
