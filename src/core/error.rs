//! 编排核心错误类型
//!
//! Scheduler 操作在违反不变量时同步返回错误；Agent 与 Supervisor 将 I/O 失败
//! 转化为任务状态与指标，不让异常逃出各自的控制循环。

use thiserror::Error;

use crate::scheduler::TaskStatus;

/// 编排核心统一 Result
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// 编排过程中可能出现的错误（未知任务、非法状态迁移、版本冲突、网关失败等）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// 状态机拒绝了本次操作（如取消已完成的任务）
    #[error("Invalid state: task {task_id} is {status:?}, cannot {operation}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        operation: &'static str,
    },

    /// 乐观并发冲突：调用方持有的版本已过期，重读后可重试
    #[error("Version conflict on task {task_id}: expected {expected}, actual {actual}")]
    Conflict {
        task_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Event bridge error: {0}")]
    Event(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}
