//! 外部协作者契约
//!
//! 编排核心与外界的三条窄边界：
//!
//! - **InstrumentGateway**：远程活动执行（启动 / 查询 / 取消 / 控制器健康）。
//!   具体线格式与传输协议在实现侧，核心不感知。
//! - **EventBridge**：活动状态的异步投递。订阅方消费标准化后的
//!   ActivityEvent，底层 pub/sub 机制由实现负责。
//! - **CorrelationStore**：簿记持久化，把活动 ID 连回任务、实验运行与步骤。
//!
//! 三者的每个调用都是异步 I/O，也是 Agent / Supervisor 控制循环中仅有的
//! 挂起点；核心对其失败一律转化为任务状态与指标。

mod activity;
mod correlation;
mod events;
mod instrument;

pub use activity::{
    ActivityData, ActivityEvent, ActivityHandle, ActivityStatus, ActivityStatusReport,
    ControllerHealth, ControllerInfo, StartActivityRequest,
};
pub use correlation::{Correlation, CorrelationStore, MemoryCorrelationStore};
pub use events::{ChannelEventBridge, EventBridge};
pub use instrument::InstrumentGateway;
