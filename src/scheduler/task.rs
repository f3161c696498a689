//! 任务模型
//!
//! Task 是调度核心唯一持有的持久记录：一次远程活动从入队到终态的完整生命周期。
//! 状态机：`pending → scheduled → running → {completed | failed | cancelled | timeout}`，
//! 其中 `failed → scheduled` 构成重试环。时间戳统一为毫秒（UTC）。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 当前 UTC 毫秒时间戳
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 有序键值对（活动选项按声明顺序传给控制器）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl KeyVal {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 已创建，等待首次派发
    Pending,
    /// 等待重试（next_retry 到期前不派发）
    Scheduled,
    /// 活动已在控制器上执行
    Running,
    /// 成功结束（此后任务不可变）
    Completed,
    /// 执行失败（可能仍被重试）
    Failed,
    /// 已取消
    Cancelled,
    /// 超过绝对时限被强制终止
    Timeout,
}

impl TaskStatus {
    /// completed / cancelled / timeout 之后不再有生命周期迁移；failed 不算终态（重试环）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Timeout)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// 编排任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 任务 ID
    pub id: String,
    /// 所属实验运行
    pub experiment_run_id: String,
    /// 所属活动（campaign）
    pub campaign_id: Option<String>,
    /// 目标控制器
    pub controller_id: String,
    /// 活动名
    pub activity_name: String,
    /// 活动选项（有序）
    pub activity_options: Vec<KeyVal>,
    /// 任务状态
    pub status: TaskStatus,
    /// 优先级
    pub priority: TaskPriority,
    /// 已重试次数，恒有 retry_count <= max_retries
    pub retry_count: u32,
    /// 重试上限
    pub max_retries: u32,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    /// 进入 scheduled 的时间（重试时刷新）
    pub scheduled_at: Option<i64>,
    /// 开始执行时间
    pub started_at: Option<i64>,
    /// 完成时间
    pub completed_at: Option<i64>,
    /// 最近一次尝试/心跳
    pub last_attempt: Option<i64>,
    /// 下次重试不早于此刻，仅在 scheduled 状态下有值
    pub next_retry: Option<i64>,
    /// 绝对截止时间，过期后不再派发也不再重试
    pub deadline: Option<i64>,
    /// 派发后由控制器分配；重试会用新的活动 ID 覆盖
    pub activity_id: Option<String>,
    /// 错误信息
    pub error: Option<String>,
    /// 元数据
    pub metadata: Option<serde_json::Value>,
    /// 乐观并发版本号，存储层每次成功变更后递增
    pub version: u64,
}

impl Task {
    /// 派发排序键：同优先级内按进入队列的时间 FIFO
    pub fn queued_at(&self) -> i64 {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 创建任务的输入参数
#[derive(Debug, Clone)]
pub struct TaskParams {
    pub experiment_run_id: String,
    pub campaign_id: Option<String>,
    pub controller_id: String,
    pub activity_name: String,
    pub activity_options: Vec<KeyVal>,
    pub priority: TaskPriority,
    /// 未设置时取调度器配置的 default_max_retries
    pub max_retries: Option<u32>,
    pub deadline: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl TaskParams {
    pub fn new(
        experiment_run_id: impl Into<String>,
        controller_id: impl Into<String>,
        activity_name: impl Into<String>,
    ) -> Self {
        Self {
            experiment_run_id: experiment_run_id.into(),
            campaign_id: None,
            controller_id: controller_id.into(),
            activity_name: activity_name.into(),
            activity_options: Vec::new(),
            priority: TaskPriority::default(),
            max_retries: None,
            deadline: None,
            metadata: None,
        }
    }

    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    pub fn with_options(mut self, options: Vec<KeyVal>) -> Self {
        self.activity_options = options;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_deadline(mut self, deadline_ms: i64) -> Self {
        self.deadline = Some(deadline_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 部分更新（生命周期字段只能走状态机操作）
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub priority: Option<TaskPriority>,
    /// 下限被钳制到当前 retry_count
    pub max_retries: Option<u32>,
    pub deadline: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// 任务查询条件，结果按 created_at 倒序
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<Vec<TaskStatus>>,
    pub experiment_run_id: Option<String>,
    pub campaign_id: Option<String>,
    pub controller_id: Option<String>,
    pub priority: Option<TaskPriority>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(vec![status]),
            ..Self::default()
        }
    }
}

/// 任务统计
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub total: usize,
    /// 各状态计数，键为状态名
    pub by_status: HashMap<String, usize>,
    /// 平均完成耗时（有 started_at 与 completed_at 的任务）
    pub avg_completion_ms: Option<f64>,
    /// 平均重试次数（retry_count > 0 的任务）
    pub avg_retries: Option<f64>,
}
