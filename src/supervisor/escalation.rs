//! 升级事件
//!
//! 自动恢复无法解决的失败经由升级事件交给外部跟进（值班通知、工单等）。
//! 处理器由使用方注册；投递是顺序的，单个处理器的失败只记日志，不影响其余。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scheduler::{now_ms, Task};

/// 升级类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationKind {
    /// 不可重试的失败
    TaskFailed,
    /// 超过绝对时限被强制终止
    ActivityTimeout,
    /// 控制器连续健康检查失败
    ControllerOffline,
    /// 重试次数耗尽
    RepeatedFailures,
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskFailed => write!(f, "task_failed"),
            Self::ActivityTimeout => write!(f, "activity_timeout"),
            Self::ControllerOffline => write!(f, "controller_offline"),
            Self::RepeatedFailures => write!(f, "repeated_failures"),
        }
    }
}

/// 升级事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub kind: EscalationKind,
    pub task_id: Option<String>,
    pub activity_id: Option<String>,
    pub controller_id: Option<String>,
    pub experiment_run_id: Option<String>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
    pub timestamp: i64,
}

impl EscalationEvent {
    pub fn new(kind: EscalationKind) -> Self {
        Self {
            kind,
            task_id: None,
            activity_id: None,
            controller_id: None,
            experiment_run_id: None,
            error: None,
            retry_count: None,
            timestamp: now_ms(),
        }
    }

    /// 从任务带上全部关联字段
    pub fn for_task(kind: EscalationKind, task: &Task) -> Self {
        Self {
            kind,
            task_id: Some(task.id.clone()),
            activity_id: task.activity_id.clone(),
            controller_id: Some(task.controller_id.clone()),
            experiment_run_id: Some(task.experiment_run_id.clone()),
            error: task.error.clone(),
            retry_count: Some(task.retry_count),
            timestamp: now_ms(),
        }
    }

    pub fn with_controller(mut self, controller_id: impl Into<String>) -> Self {
        self.controller_id = Some(controller_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// 升级处理器
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn handle(&self, event: &EscalationEvent) -> anyhow::Result<()>;
}
