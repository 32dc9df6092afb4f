//! 配置管理模块
//!
//! 提供设备、命令队列和日志配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [device]
//! backend = "dx12"        # 或 "software"
//! debug_layer = true
//! execution = "immediate" # 仅 software 后端: "immediate" 或 "manual"
//!
//! [queues]
//! max_command_lists = 256
//! abandon_policy = "reclaim"  # 或 "panic"
//! enable_copy_queue = true
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 设备配置
    #[serde(default)]
    pub device: DeviceConfig,

    /// 命令队列配置
    #[serde(default)]
    pub queues: QueueConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 后端选择
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// 是否启用底层 API 的调试层
    #[serde(default = "default_debug_layer")]
    pub debug_layer: bool,

    /// software 后端的执行方式
    #[serde(default = "default_execution")]
    pub execution: ExecutionMode,
}

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 进程内模拟的 GPU 时间线
    Software,
    /// DirectX 12 后端
    Dx12,
}

/// software 后端的执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// 提交后立即在模拟 GPU 上执行
    Immediate,
    /// 只有在显式推进时才执行（用于测试）
    Manual,
}

/// 命令队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 每个队列最多拥有的命令记录器数量
    #[serde(default = "default_max_command_lists")]
    pub max_command_lists: usize,

    /// 未执行就被丢弃的命令列表的处理策略
    #[serde(default = "default_abandon_policy")]
    pub abandon_policy: AbandonPolicy,

    /// 是否创建独立的拷贝队列
    #[serde(default = "default_enable_copy_queue")]
    pub enable_copy_queue: bool,
}

/// 命令列表未执行就被丢弃时的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbandonPolicy {
    /// 回收记录器后 panic
    Panic,
    /// 回收记录器并输出警告
    Reclaim,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_backend() -> BackendKind {
    if cfg!(target_os = "windows") {
        BackendKind::Dx12
    } else {
        BackendKind::Software
    }
}
fn default_debug_layer() -> bool { cfg!(debug_assertions) }
fn default_execution() -> ExecutionMode { ExecutionMode::Immediate }
fn default_max_command_lists() -> usize { 256 }
fn default_abandon_policy() -> AbandonPolicy {
    if cfg!(debug_assertions) {
        AbandonPolicy::Panic
    } else {
        AbandonPolicy::Reclaim
    }
}
fn default_enable_copy_queue() -> bool { true }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "dist_queue.log".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            debug_layer: default_debug_layer(),
            execution: default_execution(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_command_lists: default_max_command_lists(),
            abandon_policy: default_abandon_policy(),
            enable_copy_queue: default_enable_copy_queue(),
        }
    }
}

impl QueueConfig {
    /// 指定容量的队列配置，其余使用默认值
    pub fn with_capacity(max_command_lists: usize) -> Self {
        Self {
            max_command_lists,
            ..Self::default()
        }
    }

    /// 设置丢弃策略
    pub fn with_abandon_policy(mut self, policy: AbandonPolicy) -> Self {
        self.abandon_policy = policy;
        self
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use dist_queue::core::Config;
    ///
    /// let config = Config::from_file("config.toml")?;
    /// # Ok::<(), dist_queue::core::DistQueueError>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml_str(&contents)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12`: 使用 DirectX 12 后端
    /// - `--software`: 使用 software 后端
    /// - `--max-command-lists <value>`: 设置每个队列的记录器容量
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--dx12") {
            self.device.backend = BackendKind::Dx12;
        }

        if args.iter().any(|a| a == "--software") {
            self.device.backend = BackendKind::Software;
        }

        if let Some(idx) = args.iter().position(|a| a == "--max-command-lists") {
            if let Some(value) = args.get(idx + 1) {
                if let Ok(max) = value.parse() {
                    self.queues.max_command_lists = max;
                }
            }
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.queues.max_command_lists == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queues.max_command_lists".to_string(),
                reason: "Queue must be able to hold at least one command list".to_string(),
            }
            .into());
        }

        if self.device.backend == BackendKind::Dx12 && !cfg!(target_os = "windows") {
            return Err(ConfigError::InvalidValue {
                field: "device.backend".to_string(),
                reason: "DirectX 12 backend is only available on Windows".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

impl BackendKind {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Software => "Software",
            BackendKind::Dx12 => "DirectX 12",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queues.max_command_lists, 256);
        assert!(config.queues.enable_copy_queue);
        assert_eq!(config.device.execution, ExecutionMode::Immediate);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.device.backend = BackendKind::Software;
        assert!(config.validate().is_ok());

        config.queues.max_command_lists = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [device]
            backend = "software"
            execution = "manual"

            [queues]
            max_command_lists = 8
            abandon_policy = "reclaim"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.backend, BackendKind::Software);
        assert_eq!(config.device.execution, ExecutionMode::Manual);
        assert_eq!(config.queues.max_command_lists, 8);
        assert_eq!(config.queues.abandon_policy, AbandonPolicy::Reclaim);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_parse_error() {
        assert!(Config::from_toml_str("[queues]\nmax_command_lists = \"many\"").is_err());
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["dist_queue", "--software", "--max-command-lists", "4"]);
        assert_eq!(config.device.backend, BackendKind::Software);
        assert_eq!(config.queues.max_command_lists, 4);

        // 无法解析的值保持原样
        config.apply_args(["dist_queue", "--max-command-lists", "lots"]);
        assert_eq!(config.queues.max_command_lists, 4);
    }
}
