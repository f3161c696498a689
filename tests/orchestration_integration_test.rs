//! 编排三元组集成测试

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::{Mutex, RwLock};
    use tokio::time::{sleep, Duration};

    use foreman::core::{OrchestratorError, Result};
    use foreman::gateway::*;
    use foreman::scheduler::*;
    use foreman::supervisor::*;
    use foreman::{AgentConfig, SupervisorConfig, TaskAgent, TaskScheduler, TaskSupervisor};

    /// 可编程仪器网关：活动状态应答、控制器健康、派发/取消计数
    #[derive(Default)]
    struct SimulatedGateway {
        started: AtomicUsize,
        cancelled: AtomicUsize,
        fail_dispatch: std::sync::atomic::AtomicBool,
        status: RwLock<HashMap<String, ActivityStatus>>,
        controllers: RwLock<HashMap<String, bool>>,
    }

    impl SimulatedGateway {
        async fn set_status(&self, activity_id: &str, status: ActivityStatus) {
            self.status
                .write()
                .await
                .insert(activity_id.to_string(), status);
        }
    }

    #[async_trait]
    impl InstrumentGateway for SimulatedGateway {
        async fn start_activity(&self, request: StartActivityRequest) -> Result<ActivityHandle> {
            if self.fail_dispatch.load(Ordering::SeqCst) {
                return Err(OrchestratorError::Gateway(format!(
                    "controller {} unreachable",
                    request.controller_id
                )));
            }
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            let activity_id = format!("act_{}", n);
            self.set_status(&activity_id, ActivityStatus::Running).await;
            Ok(ActivityHandle { activity_id })
        }

        async fn activity_status(
            &self,
            _controller_id: &str,
            activity_id: &str,
        ) -> Result<ActivityStatusReport> {
            match self.status.read().await.get(activity_id) {
                Some(&status) => Ok(ActivityStatusReport {
                    status,
                    message: None,
                }),
                None => Err(OrchestratorError::Gateway("unknown activity".to_string())),
            }
        }

        async fn activity_data(
            &self,
            _controller_id: &str,
            _activity_id: &str,
        ) -> Result<ActivityData> {
            Ok(ActivityData {
                products: vec!["scan_0001.h5".to_string()],
            })
        }

        async fn cancel_activity(
            &self,
            _controller_id: &str,
            activity_id: &str,
            _reason: &str,
        ) -> Result<()> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            self.set_status(activity_id, ActivityStatus::Cancelled).await;
            Ok(())
        }

        async fn list_controllers(&self) -> Result<Vec<ControllerInfo>> {
            Ok(self
                .controllers
                .read()
                .await
                .keys()
                .map(|id| ControllerInfo {
                    controller_id: id.clone(),
                    description: None,
                })
                .collect())
        }

        async fn controller_health(&self, controller_id: &str) -> Result<ControllerHealth> {
            let healthy = *self
                .controllers
                .read()
                .await
                .get(controller_id)
                .unwrap_or(&true);
            Ok(ControllerHealth {
                healthy,
                message: None,
            })
        }
    }

    struct CollectingHandler {
        events: Mutex<Vec<EscalationEvent>>,
    }

    impl CollectingHandler {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        async fn of_kind(&self, kind: EscalationKind) -> Vec<EscalationEvent> {
            self.events
                .lock()
                .await
                .iter()
                .filter(|e| e.kind == kind)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl EscalationHandler for CollectingHandler {
        async fn handle(&self, event: &EscalationEvent) -> anyhow::Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct Rig {
        scheduler: Arc<TaskScheduler>,
        gateway: Arc<SimulatedGateway>,
        bridge: Arc<ChannelEventBridge>,
        correlations: Arc<MemoryCorrelationStore>,
        agent: Arc<TaskAgent>,
        supervisor: Arc<TaskSupervisor>,
        handler: Arc<CollectingHandler>,
    }

    async fn rig(supervisor_config: SupervisorConfig) -> Rig {
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            create_task_store(),
        ));
        let gateway = Arc::new(SimulatedGateway::default());
        let bridge = Arc::new(ChannelEventBridge::new(64));
        let correlations = Arc::new(MemoryCorrelationStore::new());

        let agent = Arc::new(TaskAgent::new(
            AgentConfig {
                poll_interval_ms: 10,
                max_concurrent: 4,
                agent_id: "agent_it".to_string(),
                verbose: false,
            },
            Arc::clone(&scheduler),
            Arc::clone(&gateway) as Arc<dyn InstrumentGateway>,
            Arc::clone(&correlations) as Arc<dyn CorrelationStore>,
            Arc::clone(&bridge) as Arc<dyn EventBridge>,
        ));

        let supervisor = Arc::new(TaskSupervisor::new(
            supervisor_config,
            Arc::clone(&scheduler),
            Arc::clone(&gateway) as Arc<dyn InstrumentGateway>,
            Arc::clone(&correlations) as Arc<dyn CorrelationStore>,
        ));
        let handler = Arc::new(CollectingHandler::new());
        supervisor
            .add_handler(Arc::clone(&handler) as Arc<dyn EscalationHandler>)
            .await;

        Rig {
            scheduler,
            gateway,
            bridge,
            correlations,
            agent,
            supervisor,
            handler,
        }
    }

    fn params(run: &str) -> TaskParams {
        TaskParams::new(run, "ctrl_beam", "SCAN")
    }

    #[tokio::test]
    async fn test_critical_task_dispatched_first() {
        let r = rig(SupervisorConfig::default()).await;
        r.scheduler
            .schedule_task(params("run_1").with_priority(TaskPriority::Critical))
            .await
            .unwrap();
        r.scheduler
            .schedule_task(params("run_1").with_priority(TaskPriority::Low))
            .await
            .unwrap();

        let next = r.scheduler.get_next_task().await.unwrap().unwrap();
        assert_eq!(next.priority, TaskPriority::Critical);
    }

    #[tokio::test]
    async fn test_full_lifecycle_via_events() {
        let r = rig(SupervisorConfig::default()).await;
        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();

        r.agent.start().await;
        sleep(Duration::from_millis(50)).await;

        let running = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        let activity_id = running.activity_id.clone().unwrap();

        // 关联记录随派发写入
        let correlation = r
            .correlations
            .find_by_activity_id(&activity_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(correlation.status, TaskStatus::Running);
        assert_eq!(correlation.experiment_run_id, "run_1");

        r.bridge
            .publish(ActivityEvent::new(&activity_id, ActivityStatus::Completed));
        sleep(Duration::from_millis(50)).await;

        let done = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());

        let correlation = r
            .correlations
            .find_by_activity_id(&activity_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(correlation.status, TaskStatus::Completed);

        let metrics = r.agent.metrics().await;
        assert_eq!(metrics.tasks_succeeded, 1);
        assert_eq!(metrics.currently_processing, 0);

        r.agent.stop().await;
    }

    #[tokio::test]
    async fn test_late_completion_reconciliation() {
        // 陈旧阈值 50ms，超时上限放大到不干扰
        let r = rig(SupervisorConfig {
            stale_threshold_ms: 50,
            activity_timeout_ms: 60_000,
            ..SupervisorConfig::default()
        })
        .await;

        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();
        r.scheduler.mark_started(&task.id, "act_late").await.unwrap();
        // 控制器早已完成，但完成事件丢了
        r.gateway.set_status("act_late", ActivityStatus::Completed).await;

        sleep(Duration::from_millis(80)).await;
        r.supervisor.run_monitor_cycle().await;

        let task = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let metrics = r.supervisor.metrics();
        assert_eq!(metrics.stale_activities_detected, 1);
        assert_eq!(metrics.checks_performed, 1);
    }

    #[tokio::test]
    async fn test_stale_probe_refreshes_heartbeat_when_still_running() {
        let r = rig(SupervisorConfig {
            stale_threshold_ms: 50,
            activity_timeout_ms: 60_000,
            ..SupervisorConfig::default()
        })
        .await;

        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();
        r.scheduler.mark_started(&task.id, "act_slow").await.unwrap();
        r.gateway.set_status("act_slow", ActivityStatus::Running).await;
        let before = r.scheduler.get_task(&task.id).await.unwrap().last_attempt;

        sleep(Duration::from_millis(80)).await;
        r.supervisor.run_monitor_cycle().await;

        let task = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.last_attempt > before);
    }

    #[tokio::test]
    async fn test_stale_probe_error_marks_failed() {
        let r = rig(SupervisorConfig {
            stale_threshold_ms: 50,
            activity_timeout_ms: 60_000,
            ..SupervisorConfig::default()
        })
        .await;

        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();
        // 网关不认识这个活动，状态查询会失败
        r.scheduler.mark_started(&task.id, "act_ghost").await.unwrap();

        sleep(Duration::from_millis(80)).await;
        r.supervisor.run_monitor_cycle().await;

        let task = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("status query failed"));
    }

    #[tokio::test]
    async fn test_timeout_enforcement() {
        let r = rig(SupervisorConfig {
            stale_threshold_ms: 60_000,
            activity_timeout_ms: 50,
            ..SupervisorConfig::default()
        })
        .await;

        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();
        r.scheduler.mark_started(&task.id, "act_stuck").await.unwrap();

        sleep(Duration::from_millis(80)).await;
        r.supervisor.run_monitor_cycle().await;

        assert_eq!(r.gateway.cancelled.load(Ordering::SeqCst), 1);
        let task = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.error.unwrap().contains("timeout"));

        let escalations = r.handler.of_kind(EscalationKind::ActivityTimeout).await;
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(r.supervisor.metrics().timeouts_enforced, 1);

        // 下一个周期不会重复强制
        r.supervisor.run_monitor_cycle().await;
        assert_eq!(r.supervisor.metrics().timeouts_enforced, 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_escalate_exactly_once() {
        let r = rig(SupervisorConfig::default()).await;
        let task = r
            .scheduler
            .schedule_task(params("run_1").with_max_retries(3))
            .await
            .unwrap();

        // 前三次失败都会被安排重试
        for round in 1..=3u32 {
            r.scheduler
                .mark_failed(&task.id, "transient beam loss")
                .await
                .unwrap();
            r.supervisor.run_monitor_cycle().await;
            let task = r.scheduler.get_task(&task.id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Scheduled);
            assert_eq!(task.retry_count, round);
        }

        // 第四次失败：预算耗尽，升级一次
        r.scheduler
            .mark_failed(&task.id, "transient beam loss")
            .await
            .unwrap();
        r.supervisor.run_monitor_cycle().await;
        r.supervisor.run_monitor_cycle().await;

        let escalations = r.handler.of_kind(EscalationKind::RepeatedFailures).await;
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].retry_count, Some(3));
        assert_eq!(escalations[0].experiment_run_id.as_deref(), Some("run_1"));
        assert_eq!(r.supervisor.metrics().retries_scheduled, 3);

        let task = r.scheduler.get_task(&task.id).await.unwrap();
        assert!(task.retry_count <= task.max_retries);
    }

    #[tokio::test]
    async fn test_non_retryable_marker_escalates_task_failed() {
        let r = rig(SupervisorConfig::default()).await;
        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();
        r.scheduler
            .mark_failed(&task.id, "unknown_activity: DRIFT")
            .await
            .unwrap();

        r.supervisor.run_monitor_cycle().await;

        let escalations = r.handler.of_kind(EscalationKind::TaskFailed).await;
        assert_eq!(escalations.len(), 1);
        // 重试预算还在也不重试
        assert_eq!(r.supervisor.metrics().retries_scheduled, 0);
    }

    #[tokio::test]
    async fn test_controller_offline_escalation() {
        let r = rig(SupervisorConfig::default()).await;
        r.gateway
            .controllers
            .write()
            .await
            .insert("ctrl_beam".to_string(), false);

        for _ in 0..3 {
            r.supervisor.run_health_checks().await;
        }

        let escalations = r.handler.of_kind(EscalationKind::ControllerOffline).await;
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].controller_id.as_deref(), Some("ctrl_beam"));

        let snapshot = r.supervisor.controller_health().await;
        assert_eq!(snapshot["ctrl_beam"].consecutive_failures, 3);
        assert!(!snapshot["ctrl_beam"].healthy);
    }

    #[tokio::test]
    async fn test_agent_respects_concurrency_bound() {
        let r = rig(SupervisorConfig::default()).await;
        for _ in 0..10 {
            r.scheduler.schedule_task(params("run_1")).await.unwrap();
        }

        r.agent.start().await;
        sleep(Duration::from_millis(80)).await;

        // 完成事件一直不来，在途执行停在上限
        assert!(r.agent.in_flight_count().await <= 4);
        assert_eq!(r.agent.metrics().await.currently_processing, 4);

        let stats = r.scheduler.task_stats().await.unwrap();
        assert_eq!(stats.by_status.get("running"), Some(&4));

        r.agent.stop().await;
    }

    #[tokio::test]
    async fn test_stop_keeps_event_listener_attached() {
        let r = rig(SupervisorConfig::default()).await;
        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();

        r.agent.start().await;
        sleep(Duration::from_millis(50)).await;
        let activity_id = r
            .scheduler
            .get_task(&task.id)
            .await
            .unwrap()
            .activity_id
            .unwrap();

        // 停止只取消轮询；在途任务的完成事件仍会被消费（排空语义）
        r.agent.stop().await;
        assert!(!r.agent.is_running().await);

        r.bridge
            .publish(ActivityEvent::new(&activity_id, ActivityStatus::Completed));
        sleep(Duration::from_millis(50)).await;

        let task = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(r.agent.metrics().await.tasks_succeeded, 1);

        // 停止后不再派发新任务
        let new_task = r.scheduler.schedule_task(params("run_1")).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            r.scheduler.get_task(&new_task.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_dispatch_failure_then_supervised_retry() {
        let r = rig(SupervisorConfig::default()).await;
        r.gateway.fail_dispatch.store(true, Ordering::SeqCst);
        let task = r.scheduler.schedule_task(params("run_1")).await.unwrap();

        r.agent.start().await;
        sleep(Duration::from_millis(50)).await;

        let failed = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        let metrics = r.agent.metrics().await;
        assert_eq!(metrics.dispatch_failures, 1);
        assert_eq!(metrics.tasks_failed, 1);

        // Agent 自己不重试；Supervisor 安排退避重试
        r.supervisor.run_monitor_cycle().await;
        let retried = r.scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Scheduled);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());

        r.agent.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_all_pending_for_run() {
        let r = rig(SupervisorConfig::default()).await;
        for _ in 0..3 {
            r.scheduler.schedule_task(params("run_abort")).await.unwrap();
        }
        r.scheduler.schedule_task(params("run_keep")).await.unwrap();

        let cancelled = r
            .supervisor
            .cancel_all_pending("run_abort", "experiment aborted")
            .await;
        assert_eq!(cancelled, 3);

        let kept = r
            .scheduler
            .query_tasks(TaskQuery {
                experiment_run_id: Some("run_keep".to_string()),
                ..TaskQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(kept[0].status, TaskStatus::Pending);
    }
}
