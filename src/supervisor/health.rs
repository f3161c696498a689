//! 控制器健康档案
//!
//! Supervisor 私有：按控制器记录连续失败次数，成功即清零。

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::scheduler::now_ms;

/// 单个控制器的健康状态
#[derive(Debug, Clone, Serialize)]
pub struct ControllerHealthState {
    pub healthy: bool,
    pub last_check: i64,
    pub consecutive_failures: u32,
    pub error: Option<String>,
}

/// 健康档案
#[derive(Default)]
pub struct HealthTracker {
    controllers: RwLock<HashMap<String, ControllerHealthState>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, controller_id: &str) {
        self.controllers.write().await.insert(
            controller_id.to_string(),
            ControllerHealthState {
                healthy: true,
                last_check: now_ms(),
                consecutive_failures: 0,
                error: None,
            },
        );
    }

    /// 记一次失败，返回累计的连续失败次数
    pub async fn record_failure(&self, controller_id: &str, error: String) -> u32 {
        let mut controllers = self.controllers.write().await;
        let entry = controllers
            .entry(controller_id.to_string())
            .or_insert_with(|| ControllerHealthState {
                healthy: true,
                last_check: 0,
                consecutive_failures: 0,
                error: None,
            });
        entry.healthy = false;
        entry.last_check = now_ms();
        entry.consecutive_failures += 1;
        entry.error = Some(error);
        entry.consecutive_failures
    }

    /// (在线, 离线) 控制器数
    pub async fn counts(&self) -> (usize, usize) {
        let controllers = self.controllers.read().await;
        let online = controllers.values().filter(|c| c.healthy).count();
        (online, controllers.len() - online)
    }

    /// 防御性拷贝
    pub async fn snapshot(&self) -> HashMap<String, ControllerHealthState> {
        self.controllers.read().await.clone()
    }
}
