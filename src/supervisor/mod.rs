//! 监督器（Supervisor）
//!
//! 周期对账与策略执行：陈旧核对、超时强制、失败重试/升级、控制器健康巡检。
//! 与 Agent 的事件路径正交，两者对同一任务记录的并发写经存储层串行化。

mod escalation;
mod health;
mod monitor;

pub use escalation::{EscalationEvent, EscalationHandler, EscalationKind};
pub use health::{ControllerHealthState, HealthTracker};
pub use monitor::{
    should_retry, SupervisorConfig, SupervisorMetrics, TaskSupervisor, NON_RETRYABLE_MARKERS,
};
