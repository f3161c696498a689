//! 核心共享类型：错误分类与统一 Result

mod error;

pub use error::{OrchestratorError, Result};
