//! 调度器（Scheduler）
//!
//! 三元组中的叶子组件：任务记录、队列排序、重试簿记与统计。
//! Agent 从这里取就绪任务，Supervisor 经由这里执行重试与强制迁移。

mod queue;
mod store;
mod task;

pub use queue::{backoff_delay_ms, SchedulerConfig, TaskScheduler};
pub use store::{create_task_store, MemoryTaskStore, TaskMutation, TaskStore};
pub use task::{
    now_ms, KeyVal, Task, TaskParams, TaskPatch, TaskPriority, TaskQuery, TaskStats, TaskStatus,
};
