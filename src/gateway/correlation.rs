//! 关联记录与存储
//!
//! Correlation 把控制器分配的活动 ID 连回任务、实验运行、campaign 与步骤。
//! 活动启动时创建，每次终态变更时更新。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::Result;
use crate::scheduler::{now_ms, TaskStatus};

/// 关联记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub activity_id: String,
    pub experiment_run_id: String,
    pub campaign_id: Option<String>,
    pub controller_id: String,
    pub activity_name: String,
    pub step_id: Option<String>,
    pub trace_id: String,
    /// 与任务生命周期同步
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Correlation {
    pub fn new(
        activity_id: impl Into<String>,
        experiment_run_id: impl Into<String>,
        controller_id: impl Into<String>,
        activity_name: impl Into<String>,
        status: TaskStatus,
    ) -> Self {
        let now = now_ms();
        Self {
            activity_id: activity_id.into(),
            experiment_run_id: experiment_run_id.into(),
            campaign_id: None,
            controller_id: controller_id.into(),
            activity_name: activity_name.into(),
            step_id: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// 关联记录存储接口
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    async fn save(&self, correlation: Correlation) -> Result<()>;

    async fn find_by_activity_id(&self, activity_id: &str) -> Result<Option<Correlation>>;

    async fn find_by_experiment_run_id(&self, experiment_run_id: &str) -> Result<Vec<Correlation>>;

    async fn find_by_step_id(&self, step_id: &str) -> Result<Vec<Correlation>>;

    /// 更新状态并刷新 updated_at；未知活动 ID 静默忽略
    async fn update_status(&self, activity_id: &str, status: TaskStatus) -> Result<()>;

    async fn delete(&self, activity_id: &str) -> Result<()>;
}

/// 内存关联存储
#[derive(Default)]
pub struct MemoryCorrelationStore {
    records: RwLock<HashMap<String, Correlation>>,
}

impl MemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStore for MemoryCorrelationStore {
    async fn save(&self, correlation: Correlation) -> Result<()> {
        self.records
            .write()
            .await
            .insert(correlation.activity_id.clone(), correlation);
        Ok(())
    }

    async fn find_by_activity_id(&self, activity_id: &str) -> Result<Option<Correlation>> {
        Ok(self.records.read().await.get(activity_id).cloned())
    }

    async fn find_by_experiment_run_id(&self, experiment_run_id: &str) -> Result<Vec<Correlation>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|c| c.experiment_run_id == experiment_run_id)
            .cloned()
            .collect())
    }

    async fn find_by_step_id(&self, step_id: &str) -> Result<Vec<Correlation>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|c| c.step_id.as_deref() == Some(step_id))
            .cloned()
            .collect())
    }

    async fn update_status(&self, activity_id: &str, status: TaskStatus) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(activity_id) {
            record.status = status;
            record.updated_at = now_ms();
        }
        Ok(())
    }

    async fn delete(&self, activity_id: &str) -> Result<()> {
        self.records.write().await.remove(activity_id);
        Ok(())
    }
}
