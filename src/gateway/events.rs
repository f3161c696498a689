//! 事件桥：活动状态的异步投递
//!
//! 订阅方拿到一个 broadcast 接收端，丢弃接收端即退订。底层传输
//! （消息总线、SSE 等）由实现负责，核心只消费标准化后的 ActivityEvent。

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::activity::ActivityEvent;
use crate::core::Result;

/// 事件桥接口
#[async_trait]
pub trait EventBridge: Send + Sync {
    /// 订阅活动事件流
    fn subscribe(&self) -> broadcast::Receiver<ActivityEvent>;

    /// 启动底层传输
    async fn start(&self) -> Result<()>;

    /// 停止底层传输
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// 进程内事件桥（broadcast 通道）
///
/// 供进程内组装与测试使用；外部传输的适配器把解析后的事件喂给 `publish`。
pub struct ChannelEventBridge {
    tx: broadcast::Sender<ActivityEvent>,
    running: AtomicBool,
}

impl ChannelEventBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            running: AtomicBool::new(false),
        }
    }

    /// 投递一条事件；当前没有订阅者时静默丢弃
    pub fn publish(&self, event: ActivityEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ChannelEventBridge {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EventBridge for ChannelEventBridge {
    fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::activity::ActivityStatus;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bridge = ChannelEventBridge::new(8);
        let mut rx = bridge.subscribe();

        bridge.publish(ActivityEvent::new("act_1", ActivityStatus::Completed));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.activity_id, "act_1");
        assert_eq!(event.status, ActivityStatus::Completed);
    }

    #[tokio::test]
    async fn test_lifecycle_flag() {
        let bridge = ChannelEventBridge::default();
        assert!(!bridge.is_running());
        bridge.start().await.unwrap();
        assert!(bridge.is_running());
        bridge.stop().await.unwrap();
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bridge = ChannelEventBridge::new(8);
        // 不应 panic，也不应阻塞
        bridge.publish(ActivityEvent::new("act_1", ActivityStatus::Failed));
    }
}
