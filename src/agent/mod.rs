//! 执行代理（Agent）
//!
//! 轮询调度器、经网关派发、靠事件桥收尾的有界并发执行器。

mod runtime;

pub use runtime::{AgentConfig, AgentMetrics, ExecutionStatus, TaskAgent};
