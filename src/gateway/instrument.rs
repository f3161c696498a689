//! 仪器网关接口
//!
//! 远程活动执行的唯一出口。传输协议（HTTP / 消息总线）在实现侧，核心只依赖
//! 这里的窄契约；每个调用都是异步 I/O，也是各控制循环中仅有的挂起点。

use async_trait::async_trait;

use super::activity::{
    ActivityData, ActivityHandle, ActivityStatusReport, ControllerHealth, ControllerInfo,
    StartActivityRequest,
};
use crate::core::Result;

/// 仪器网关
#[async_trait]
pub trait InstrumentGateway: Send + Sync {
    /// 在控制器上启动活动，返回控制器分配的活动 ID
    async fn start_activity(&self, request: StartActivityRequest) -> Result<ActivityHandle>;

    /// 查询活动状态
    async fn activity_status(
        &self,
        controller_id: &str,
        activity_id: &str,
    ) -> Result<ActivityStatusReport>;

    /// 获取活动产物
    async fn activity_data(&self, controller_id: &str, activity_id: &str) -> Result<ActivityData>;

    /// 要求控制器停止活动。远程调用没有协作式取消信号，本地簿记只能通过
    /// 后续轮询或事件得知结果
    async fn cancel_activity(
        &self,
        controller_id: &str,
        activity_id: &str,
        reason: &str,
    ) -> Result<()>;

    /// 列出已知控制器
    async fn list_controllers(&self) -> Result<Vec<ControllerInfo>>;

    /// 查询控制器健康
    async fn controller_health(&self, controller_id: &str) -> Result<ControllerHealth>;
}
