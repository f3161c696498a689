//! 活动报文类型
//!
//! 控制器侧的状态与事件载荷。事件是封闭的强类型结构，必填/可选字段显式声明，
//! 不使用开放数据袋，生产者与消费者之间不会发生字段名漂移。

use serde::{Deserialize, Serialize};

use super::correlation::Correlation;
use crate::scheduler::KeyVal;

/// 控制器报告的活动状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ActivityStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 活动状态事件（EventBridge 投递）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub activity_id: String,
    pub status: ActivityStatus,
    /// 进度（0-100）
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl ActivityEvent {
    pub fn new(activity_id: impl Into<String>, status: ActivityStatus) -> Self {
        Self {
            activity_id: activity_id.into(),
            status,
            progress: None,
            message: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// 启动活动请求
#[derive(Debug, Clone)]
pub struct StartActivityRequest {
    pub controller_id: String,
    pub activity_name: String,
    /// 有序活动选项
    pub options: Vec<KeyVal>,
    /// 绝对截止时间（毫秒时间戳）
    pub deadline: Option<i64>,
    /// 关联记录，网关可向下游透传 trace 信息
    pub correlation: Correlation,
}

/// 启动活动的返回：控制器分配的活动 ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityHandle {
    pub activity_id: String,
}

/// 状态查询的返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStatusReport {
    pub status: ActivityStatus,
    pub message: Option<String>,
}

/// 活动产物
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityData {
    pub products: Vec<String>,
}

/// 控制器信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub controller_id: String,
    pub description: Option<String>,
}

/// 控制器健康查询的返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerHealth {
    pub healthy: bool,
    pub message: Option<String>,
}
