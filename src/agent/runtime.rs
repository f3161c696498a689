//! 任务执行代理
//!
//! 有界并发地派发就绪任务：按固定间隔轮询调度器（启动时立即轮询一次），
//! 经网关启动活动，再靠事件桥的完成通知收尾。派发失败直接记为任务失败，
//! 本层不做任何重试，重试策略完全归 Supervisor。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::{
    ActivityEvent, ActivityStatus, Correlation, CorrelationStore, EventBridge, InstrumentGateway,
    StartActivityRequest,
};
use crate::scheduler::{now_ms, Task, TaskScheduler, TaskStatus};

/// Agent 配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 在途执行上限
    pub max_concurrent: usize,
    /// Agent 标识（日志与指标）
    pub agent_id: String,
    /// 逐任务的详细日志
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_concurrent: 4,
            agent_id: format!("agent_{}", &uuid::Uuid::new_v4().to_string()[..8]),
            verbose: false,
        }
    }
}

/// 在途执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// 网关调用进行中
    Starting,
    /// 控制器已接受，等待完成事件
    Running,
    /// 已收到进度但尚未终态
    Waiting,
    Completed,
    Failed,
}

/// 在途执行记录
#[derive(Debug, Clone)]
struct Execution {
    activity_id: Option<String>,
    start_time: Instant,
    status: ExecutionStatus,
}

impl Execution {
    fn starting() -> Self {
        Self {
            activity_id: None,
            start_time: Instant::now(),
            status: ExecutionStatus::Starting,
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub started_at: i64,
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// 派发阶段被吞掉的网关错误也计入这里，测试可以断言计数而不是扒日志
    pub dispatch_failures: u64,
    pub currently_processing: u64,
    pub last_task_time: Option<i64>,
    pub avg_processing_time_ms: Option<f64>,
}

#[derive(Default)]
struct AgentStats {
    tasks_processed: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    dispatch_failures: AtomicU64,
    currently_processing: AtomicU64,
    last_task_time: AtomicI64,
    /// 最近 100 次完成耗时的滚动窗口
    durations: RwLock<VecDeque<u64>>,
}

const DURATION_WINDOW: usize = 100;

/// 任务执行代理
pub struct TaskAgent {
    config: AgentConfig,
    scheduler: Arc<TaskScheduler>,
    gateway: Arc<dyn InstrumentGateway>,
    correlations: Arc<dyn CorrelationStore>,
    events: Arc<dyn EventBridge>,
    in_flight: RwLock<HashMap<String, Execution>>,
    stats: AgentStats,
    started_at: i64,
    /// 轮询循环的取消令牌；Some 表示已启动
    poll_cancel: Mutex<Option<CancellationToken>>,
}

impl TaskAgent {
    pub fn new(
        config: AgentConfig,
        scheduler: Arc<TaskScheduler>,
        gateway: Arc<dyn InstrumentGateway>,
        correlations: Arc<dyn CorrelationStore>,
        events: Arc<dyn EventBridge>,
    ) -> Self {
        Self {
            config,
            scheduler,
            gateway,
            correlations,
            events,
            in_flight: RwLock::new(HashMap::new()),
            stats: AgentStats::default(),
            started_at: now_ms(),
            poll_cancel: Mutex::new(None),
        }
    }

    /// 启动：订阅事件流并拉起轮询循环，首次轮询立即执行。重复调用无效果。
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.poll_cancel.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        info!(
            "Agent {} starting (max_concurrent={}, poll={}ms)",
            self.config.agent_id, self.config.max_concurrent, self.config.poll_interval_ms
        );

        // 事件监听不挂在轮询令牌上：stop() 之后在途任务仍能收尾
        let rx = self.events.subscribe();
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.event_loop(rx).await });

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(agent.config.poll_interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => agent.poll_once().await,
                }
            }
            debug!("Agent {} poll loop exited", agent.config.agent_id);
        });
    }

    /// 停止轮询。只取消轮询定时器：事件订阅保留，在途执行继续跑到完成
    /// （排空语义）。重复调用无效果。
    pub async fn stop(&self) {
        let mut guard = self.poll_cancel.lock().await;
        if let Some(token) = guard.take() {
            token.cancel();
            info!("Agent {} stopped polling, draining in-flight work", self.config.agent_id);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.poll_cancel.lock().await.is_some()
    }

    /// 一个轮询节拍：按空余槽位取就绪任务，逐个独立派发。
    /// 单个任务的派发失败不会中断本节拍，也不会阻塞同批任务。
    pub async fn poll_once(self: &Arc<Self>) {
        let available = {
            let in_flight = self.in_flight.read().await;
            self.config.max_concurrent.saturating_sub(in_flight.len())
        };
        if available == 0 {
            if self.config.verbose {
                debug!("Agent {} at capacity, skipping tick", self.config.agent_id);
            }
            return;
        }

        let ready = match self.scheduler.get_ready_tasks(available).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Ready-task query failed: {}", e);
                return;
            }
        };

        for task in ready {
            {
                let mut in_flight = self.in_flight.write().await;
                if in_flight.len() >= self.config.max_concurrent {
                    break;
                }
                // 上一节拍的派发尚未把任务迁出 pending 时会被再次查到
                if in_flight.contains_key(&task.id) {
                    continue;
                }
                in_flight.insert(task.id.clone(), Execution::starting());
            }
            self.stats.tasks_processed.fetch_add(1, Ordering::Relaxed);
            self.stats.currently_processing.fetch_add(1, Ordering::Relaxed);

            let agent = Arc::clone(self);
            tokio::spawn(async move { agent.dispatch(task).await });
        }
    }

    /// 派发一个任务：网关启动活动，成功则 running + 关联记录，
    /// 失败则立即记为任务失败（重试与否由 Supervisor 决定）。
    async fn dispatch(self: Arc<Self>, task: Task) {
        let step_id = task
            .metadata
            .as_ref()
            .and_then(|m| m.get("step_id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        let mut correlation = Correlation::new(
            String::new(),
            task.experiment_run_id.clone(),
            task.controller_id.clone(),
            task.activity_name.clone(),
            TaskStatus::Running,
        );
        if let Some(campaign_id) = &task.campaign_id {
            correlation = correlation.with_campaign(campaign_id.clone());
        }
        if let Some(step_id) = step_id {
            correlation = correlation.with_step(step_id);
        }

        let request = StartActivityRequest {
            controller_id: task.controller_id.clone(),
            activity_name: task.activity_name.clone(),
            options: task.activity_options.clone(),
            deadline: task.deadline,
            correlation: correlation.clone(),
        };

        match self.gateway.start_activity(request).await {
            Ok(handle) => {
                if let Err(e) = self.scheduler.mark_started(&task.id, &handle.activity_id).await {
                    // 派发窗口内任务被并发改写（如已被取消），放弃这次执行
                    warn!("Task {} changed during dispatch: {}", task.id, e);
                    self.in_flight.write().await.remove(&task.id);
                    self.stats.currently_processing.fetch_sub(1, Ordering::Relaxed);
                    return;
                }

                {
                    let mut in_flight = self.in_flight.write().await;
                    if let Some(exec) = in_flight.get_mut(&task.id) {
                        exec.activity_id = Some(handle.activity_id.clone());
                        exec.status = ExecutionStatus::Running;
                    }
                }

                correlation.activity_id = handle.activity_id.clone();
                if let Err(e) = self.correlations.save(correlation).await {
                    warn!("Correlation save failed for {}: {}", handle.activity_id, e);
                }

                if self.config.verbose {
                    info!(
                        "Task {} dispatched as activity {} on {}",
                        task.id, handle.activity_id, task.controller_id
                    );
                }
            }
            Err(e) => {
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Dispatch of task {} failed: {}", task.id, e);

                if let Err(err) = self
                    .scheduler
                    .mark_failed(&task.id, &format!("dispatch failed: {}", e))
                    .await
                {
                    warn!("Could not record dispatch failure for {}: {}", task.id, err);
                }
                self.in_flight.write().await.remove(&task.id);
                self.stats.currently_processing.fetch_sub(1, Ordering::Relaxed);
                self.stats.last_task_time.store(now_ms(), Ordering::Relaxed);
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut rx: broadcast::Receiver<ActivityEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Agent {} event stream lagged, {} events dropped",
                        self.config.agent_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Agent {} event loop exited", self.config.agent_id);
    }

    /// 处理一条标准化事件：只对在途活动的终态事件动手，
    /// running/pending 之类的中间状态不触碰执行记录。
    async fn handle_event(&self, event: ActivityEvent) {
        if !event.status.is_terminal() {
            return;
        }

        let task_id = {
            let in_flight = self.in_flight.read().await;
            in_flight
                .iter()
                .find(|(_, exec)| exec.activity_id.as_deref() == Some(event.activity_id.as_str()))
                .map(|(id, _)| id.clone())
        };
        let Some(task_id) = task_id else {
            return;
        };

        // 先移除执行记录占住这条事件，双重投递时只有一方生效
        let Some(mut exec) = self.in_flight.write().await.remove(&task_id) else {
            return;
        };

        match event.status {
            ActivityStatus::Completed => {
                exec.status = ExecutionStatus::Completed;
                match self.scheduler.mark_completed(&task_id).await {
                    Ok(_) => {
                        if let Err(e) = self
                            .correlations
                            .update_status(&event.activity_id, TaskStatus::Completed)
                            .await
                        {
                            warn!("Correlation update failed for {}: {}", event.activity_id, e);
                        }
                        let duration = exec.start_time.elapsed().as_millis() as u64;
                        self.record_duration(duration).await;
                        self.stats.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
                        if self.config.verbose {
                            info!("Task {} completed in {}ms", task_id, duration);
                        }
                    }
                    Err(e) => {
                        // 已被 Supervisor 收尾（超时/取消），事件只做占位清理
                        debug!("Completion event for {} superseded: {}", task_id, e);
                    }
                }
            }
            ActivityStatus::Failed | ActivityStatus::Cancelled => {
                exec.status = ExecutionStatus::Failed;
                let reason = event
                    .error
                    .clone()
                    .or_else(|| event.message.clone())
                    .unwrap_or_else(|| format!("activity {}", event.status));
                match self.scheduler.mark_failed(&task_id, &reason).await {
                    Ok(_) => {
                        let status = if event.status == ActivityStatus::Cancelled {
                            TaskStatus::Cancelled
                        } else {
                            TaskStatus::Failed
                        };
                        if let Err(e) = self
                            .correlations
                            .update_status(&event.activity_id, status)
                            .await
                        {
                            warn!("Correlation update failed for {}: {}", event.activity_id, e);
                        }
                        self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
                        if self.config.verbose {
                            info!("Task {} failed: {}", task_id, reason);
                        }
                    }
                    Err(e) => {
                        debug!("Failure event for {} superseded: {}", task_id, e);
                    }
                }
            }
            _ => unreachable!("non-terminal events filtered above"),
        }

        self.stats.currently_processing.fetch_sub(1, Ordering::Relaxed);
        self.stats.last_task_time.store(now_ms(), Ordering::Relaxed);
    }

    async fn record_duration(&self, duration_ms: u64) {
        let mut window = self.stats.durations.write().await;
        if window.len() == DURATION_WINDOW {
            window.pop_front();
        }
        window.push_back(duration_ms);
    }

    /// 当前在途执行数
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// 指标快照
    pub async fn metrics(&self) -> AgentMetrics {
        let window = self.stats.durations.read().await;
        let avg_processing_time_ms = if window.is_empty() {
            None
        } else {
            Some(window.iter().sum::<u64>() as f64 / window.len() as f64)
        };
        let last = self.stats.last_task_time.load(Ordering::Relaxed);

        AgentMetrics {
            agent_id: self.config.agent_id.clone(),
            started_at: self.started_at,
            tasks_processed: self.stats.tasks_processed.load(Ordering::Relaxed),
            tasks_succeeded: self.stats.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.stats.tasks_failed.load(Ordering::Relaxed),
            dispatch_failures: self.stats.dispatch_failures.load(Ordering::Relaxed),
            currently_processing: self.stats.currently_processing.load(Ordering::Relaxed),
            last_task_time: (last > 0).then_some(last),
            avg_processing_time_ms,
        }
    }
}
