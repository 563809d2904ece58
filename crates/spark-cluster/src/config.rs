//! 分发工厂配置。
//!
//! 配置由宿主装配层提供（通常来自 TOML 片段），本模块只负责反序列化、默认值与校验，
//! 不读取文件也不感知环境变量。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MarshallingVersion;
use crate::error::ConfigError;

const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_THREADS: usize = 8;
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_VIEW_HISTORY_LENGTH: usize = 100;

/// [`ChannelDispatcherFactory`](crate::dispatcher::ChannelDispatcherFactory) 的运行参数。
///
/// # 契约说明（What）
/// - `response_timeout_ms`：单次请求等待响应的上限，默认 60 秒；
/// - `max_threads`：同时执行入站命令的工作线程上限；
/// - `queue_capacity`：工作线程全部忙碌时允许排队的命令数，超出即拒绝并回复 not-found 哨兵；
/// - `shutdown_timeout_ms`：关闭时等待在途命令完成的时长；
/// - `marshalling_version`：本节点发送请求使用的编组版本号，见 [`MarshallingVersion`]；
/// - `view_history_length`：保留的视图历史条数，0 表示不记录；
/// - `synchronous_notifications`：是否允许监听者在视图投递线程上同步回调，默认关闭。
///
/// 缺省字段回落到默认值，未知字段视为错误。
///
/// ```
/// use spark_cluster::config::DispatcherConfig;
///
/// let config = DispatcherConfig::from_toml_str("response_timeout_ms = 500").unwrap();
/// assert_eq!(config.response_timeout().as_millis(), 500);
/// assert_eq!(config.max_threads(), 8);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    response_timeout_ms: u64,
    max_threads: usize,
    queue_capacity: usize,
    shutdown_timeout_ms: u64,
    marshalling_version: u8,
    view_history_length: usize,
    synchronous_notifications: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            max_threads: DEFAULT_MAX_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            marshalling_version: MarshallingVersion::CURRENT.as_u8(),
            view_history_length: DEFAULT_VIEW_HISTORY_LENGTH,
            synchronous_notifications: false,
        }
    }
}

impl DispatcherConfig {
    /// 创建默认配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Zero {
                field: "max_threads",
            });
        }
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Timeout(self.response_timeout()));
        }
        Ok(())
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_marshalling_version(mut self, version: MarshallingVersion) -> Self {
        self.marshalling_version = version.as_u8();
        self
    }

    pub fn with_view_history_length(mut self, length: usize) -> Self {
        self.view_history_length = length;
        self
    }

    pub fn with_synchronous_notifications(mut self, allow: bool) -> Self {
        self.synchronous_notifications = allow;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn view_history_length(&self) -> usize {
        self.view_history_length
    }

    pub fn synchronous_notifications(&self) -> bool {
        self.synchronous_notifications
    }

    /// 原始版本号；由工厂在构造时经版本表解析一次。
    pub fn marshalling_version(&self) -> u8 {
        self.marshalling_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = DispatcherConfig::from_toml_str("").expect("空配置应回落默认值");
        assert_eq!(config, DispatcherConfig::default());
        assert_eq!(config.response_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn overrides_are_applied() {
        let raw = r#"
            response_timeout_ms = 250
            max_threads = 2
            queue_capacity = 4
            shutdown_timeout_ms = 100
            view_history_length = 5
            synchronous_notifications = true
        "#;
        let config = DispatcherConfig::from_toml_str(raw).expect("合法配置应解析成功");
        assert_eq!(config.response_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_threads(), 2);
        assert_eq!(config.queue_capacity(), 4);
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(100));
        assert_eq!(config.view_history_length(), 5);
        assert!(config.synchronous_notifications());
    }

    #[test]
    fn unknown_fields_and_zero_threads_are_rejected() {
        assert!(matches!(
            DispatcherConfig::from_toml_str("threads = 3"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            DispatcherConfig::from_toml_str("max_threads = 0"),
            Err(ConfigError::Zero {
                field: "max_threads"
            })
        ));
    }
}
