//! Foreman - 仪器控制编排核心
//!
//! Scheduler–Agent–Supervisor 三元组，协调外部仪器控制器上长时间运行、
//! 容易失败的远程活动。三个组件在同一进程内作为独立的定时器驱动循环运行，
//! 互不阻塞；对同一任务记录的并发写经存储层按键串行化。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与统一 Result
//! - **scheduler**: 持久优先级任务队列（任务记录、排序、重试簿记、统计）
//! - **agent**: 有界并发执行代理（轮询派发 + 事件收尾）
//! - **supervisor**: 周期对账与策略执行（陈旧核对、超时强制、重试/升级、健康巡检）
//! - **gateway**: 外部协作者契约（仪器网关 / 事件桥 / 关联存储）
//! - **observability**: tracing 初始化

pub mod agent;
pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod scheduler;
pub mod supervisor;

pub use agent::{AgentConfig, TaskAgent};
pub use scheduler::{SchedulerConfig, TaskScheduler};
pub use supervisor::{SupervisorConfig, TaskSupervisor};
