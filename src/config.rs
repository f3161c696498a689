//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FOREMAN__*` 覆盖（双下划线表示嵌套，
//! 如 `FOREMAN__AGENT__MAX_CONCURRENT=8`）。各段落映射到组件运行时配置。

use std::path::PathBuf;

use serde::Deserialize;

use crate::agent::AgentConfig;
use crate::scheduler::SchedulerConfig;
use crate::supervisor::SupervisorConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

/// [scheduler] 段：重试上限与退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub default_max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            default_max_retries: defaults.default_max_retries,
            base_retry_delay_ms: defaults.base_retry_delay_ms,
            max_retry_delay_ms: defaults.max_retry_delay_ms,
        }
    }
}

impl SchedulerSection {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_max_retries: self.default_max_retries,
            base_retry_delay_ms: self.base_retry_delay_ms,
            max_retry_delay_ms: self.max_retry_delay_ms,
        }
    }
}

/// [agent] 段：轮询间隔、并发上限、标识
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    /// 未设置时生成随机的 agent_xxxxxxxx
    pub agent_id: Option<String>,
    pub verbose: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            poll_interval_ms: defaults.poll_interval_ms,
            max_concurrent: defaults.max_concurrent,
            agent_id: None,
            verbose: false,
        }
    }
}

impl AgentSection {
    pub fn to_config(&self) -> AgentConfig {
        AgentConfig {
            poll_interval_ms: self.poll_interval_ms,
            max_concurrent: self.max_concurrent,
            agent_id: self
                .agent_id
                .clone()
                .unwrap_or_else(|| AgentConfig::default().agent_id),
            verbose: self.verbose,
        }
    }
}

/// [supervisor] 段：监控/健康巡检周期与策略开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub monitor_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub activity_timeout_ms: u64,
    pub auto_retry_enabled: bool,
    pub escalation_enabled: bool,
    pub health_check_interval_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            monitor_interval_ms: defaults.monitor_interval_ms,
            stale_threshold_ms: defaults.stale_threshold_ms,
            activity_timeout_ms: defaults.activity_timeout_ms,
            auto_retry_enabled: defaults.auto_retry_enabled,
            escalation_enabled: defaults.escalation_enabled,
            health_check_interval_ms: defaults.health_check_interval_ms,
        }
    }
}

impl SupervisorSection {
    pub fn to_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            monitor_interval_ms: self.monitor_interval_ms,
            stale_threshold_ms: self.stale_threshold_ms,
            activity_timeout_ms: self.activity_timeout_ms,
            auto_retry_enabled: self.auto_retry_enabled,
            escalation_enabled: self.escalation_enabled,
            health_check_interval_ms: self.health_check_interval_ms,
        }
    }
}

/// 从 config 目录加载配置，环境变量 FOREMAN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FOREMAN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FOREMAN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();

        let scheduler = cfg.scheduler.to_config();
        assert_eq!(scheduler.default_max_retries, 3);
        assert_eq!(scheduler.base_retry_delay_ms, 1_000);

        let agent = cfg.agent.to_config();
        assert_eq!(agent.max_concurrent, 4);
        assert!(agent.agent_id.starts_with("agent_"));

        let supervisor = cfg.supervisor.to_config();
        assert!(supervisor.auto_retry_enabled);
        assert!(supervisor.escalation_enabled);
        assert_eq!(supervisor.stale_threshold_ms, 30_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[scheduler]
default_max_retries = 7

[agent]
max_concurrent = 16
agent_id = "agent_beamline"

[supervisor]
auto_retry_enabled = false
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.scheduler.to_config().default_max_retries, 7);
        assert_eq!(cfg.agent.to_config().max_concurrent, 16);
        assert_eq!(cfg.agent.to_config().agent_id, "agent_beamline");
        assert!(!cfg.supervisor.to_config().auto_retry_enabled);
        // 未出现的键保持默认
        assert_eq!(cfg.scheduler.to_config().base_retry_delay_ms, 1_000);
    }
}
