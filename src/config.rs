use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

use crate::pricing::TokenRate;

/// 主配置结构体
///
/// 包含任务调度核心的所有配置信息，从配置文件和环境变量加载
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// AI提供商配置列表（列表顺序即注册顺序）
    pub providers: Vec<ProviderDetail>,
    /// 任务调度配置（可选，有默认值）
    #[serde(default)]
    pub jobs: JobsConfig,
    /// 通知配置（可选，有默认值）
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// 日志配置（可选，有默认值）
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 性能配置（可选，有默认值）
    #[serde(default)]
    pub performance: PerformanceConfig,
}

/// Backend family a provider entry talks to
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Chat-completions API with delta-array streaming
    OpenAI,
    /// Messages API with content-block streaming
    Anthropic,
    /// Self-hosted inference server
    Local,
    /// Deterministic in-process test double
    Stub,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Local => "local",
            ProviderType::Stub => "stub",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProviderDetail {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: String,
    pub models: Option<Vec<String>>,
    pub default_model: Option<String>,
    pub image_model: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-model static rates used when the pricing table has nothing
    #[serde(default)]
    pub fallback_rates: HashMap<String, TokenRate>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct JobsConfig {
    /// Provider names tried in order when a submission names none
    #[serde(default)]
    pub default_providers: Vec<String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NotificationConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PerformanceConfig {
    #[serde(default = "default_connection_pool_size")]
    pub connection_pool_size: usize,
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout_seconds: u64,
    #[serde(default = "default_availability_timeout_ms")]
    pub availability_timeout_ms: u64,
}

// Default value functions
fn default_provider_timeout() -> u64 { 60 }
fn default_enabled() -> bool { true }
fn default_max_concurrent_jobs() -> usize { 32 }
fn default_queue_size() -> usize { 1024 }
fn default_channel_capacity() -> usize { 256 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }
fn default_connection_pool_size() -> usize { 10 }
fn default_keep_alive_timeout() -> u64 { 90 }
fn default_availability_timeout_ms() -> u64 { 2000 }

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_providers: Vec::new(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            connection_pool_size: default_connection_pool_size(),
            keep_alive_timeout_seconds: default_keep_alive_timeout(),
            availability_timeout_ms: default_availability_timeout_ms(),
        }
    }
}

/// 加载配置文件和环境变量
///
/// ## 功能说明
/// 从config.toml文件和环境变量（前缀AI_AGG_，嵌套字段使用`__`分隔）加载配置，
/// 环境变量会覆盖配置文件中的相同设置
///
/// ## 执行例子
/// ```rust,ignore
/// let config = load_config()?;
/// println!("{} providers configured", config.providers.len());
/// ```
pub fn load_config() -> Result<Config> {
    load_config_from("config.toml")
}

/// Load configuration from an explicit file path plus `AI_AGG_` env overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("AI_AGG_").split("__"))
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration from {} or environment variables",
                path.display()
            )
        })?;

    config.validate().context("Configuration validation failed")?;

    Ok(config)
}

impl Config {
    /// 验证整个配置的有效性
    ///
    /// ## 内部实现逻辑
    /// 1. 检查至少配置了一个提供商，且提供商名称不重复
    /// 2. 逐个验证每个提供商的配置
    /// 3. 检查默认提供商列表只引用已配置的提供商
    /// 4. 验证任务、通知、日志和性能配置
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(anyhow::anyhow!("At least one provider must be configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(anyhow::anyhow!("Duplicate provider name '{}'", provider.name));
            }
            provider
                .validate()
                .with_context(|| format!("Provider '{}' configuration validation failed", provider.name))?;
        }

        for name in &self.jobs.default_providers {
            if !seen.contains(name.as_str()) {
                return Err(anyhow::anyhow!(
                    "Default provider '{}' is not configured",
                    name
                ));
            }
        }

        self.jobs.validate().context("Jobs configuration validation failed")?;
        self.notifications
            .validate()
            .context("Notification configuration validation failed")?;
        self.logging.validate().context("Logging configuration validation failed")?;
        self.performance
            .validate()
            .context("Performance configuration validation failed")?;

        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderDetail> {
        self.providers.iter().find(|p| p.name == name)
    }
}

impl ProviderDetail {
    /// 验证AI提供商配置参数
    ///
    /// ## 参数验证规则
    /// - `name`: 不能为空，只能包含字母、数字、`-`、`_`
    /// - `api_key`: OpenAI/Anthropic类型必须提供，至少10个字符
    /// - `api_base`: OpenAI/Anthropic/Local类型必须以http://或https://开头
    /// - `timeout_seconds`: 1-600秒之间
    /// - `models`: 如果提供，不能为空列表，模型名不能为空
    /// - `fallback_rates`: 价格必须是非负有限数
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(anyhow::anyhow!("Provider name cannot be empty"));
        }

        if !self.name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Err(anyhow::anyhow!("Provider name contains invalid characters"));
        }

        let needs_key = matches!(self.provider_type, ProviderType::OpenAI | ProviderType::Anthropic);
        if needs_key && self.api_key.len() < 10 {
            return Err(anyhow::anyhow!(
                "Provider API key seems too short (minimum 10 characters)"
            ));
        }

        if self.provider_type != ProviderType::Stub
            && !self.api_base.starts_with("http://")
            && !self.api_base.starts_with("https://")
        {
            return Err(anyhow::anyhow!(
                "Provider API base URL must start with http:// or https://"
            ));
        }

        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Provider timeout must be greater than 0"));
        }

        if self.timeout_seconds > 600 {
            return Err(anyhow::anyhow!("Provider timeout cannot exceed 600 seconds"));
        }

        if let Some(models) = &self.models {
            if models.is_empty() {
                return Err(anyhow::anyhow!("Provider models list cannot be empty if specified"));
            }

            if models.iter().any(|m| m.is_empty()) {
                return Err(anyhow::anyhow!("Provider model name cannot be empty"));
            }
        }

        for (model, rate) in &self.fallback_rates {
            let prices = [
                rate.input_per_million,
                rate.output_per_million,
                rate.image_price.unwrap_or(0.0),
            ];
            if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(anyhow::anyhow!(
                    "Fallback rate for model '{}' must be finite and non-negative",
                    model
                ));
            }
        }

        Ok(())
    }

    /// Base URL with exactly one trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}/", self.api_base.trim_end_matches('/'))
    }
}

impl JobsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("Max concurrent jobs must be greater than 0"));
        }

        if self.max_concurrent_jobs > 10000 {
            return Err(anyhow::anyhow!("Max concurrent jobs cannot exceed 10000"));
        }

        Ok(())
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(anyhow::anyhow!("Notification queue size must be greater than 0"));
        }

        if self.channel_capacity == 0 {
            return Err(anyhow::anyhow!("Notification channel capacity must be greater than 0"));
        }

        Ok(())
    }
}

impl LoggingConfig {
    /// 验证日志配置参数
    ///
    /// ## 参数验证规则
    /// - `level`: 必须是 "trace", "debug", "info", "warn", "error" 之一
    /// - `format`: 必须是 "json", "pretty", "compact" 之一
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}': must be one of {:?}",
                self.level,
                valid_levels
            ));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}': must be one of {:?}",
                self.format,
                valid_formats
            ));
        }

        Ok(())
    }
}

impl PerformanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection_pool_size == 0 {
            return Err(anyhow::anyhow!("Connection pool size must be greater than 0"));
        }

        if self.connection_pool_size > 1000 {
            return Err(anyhow::anyhow!("Connection pool size cannot exceed 1000"));
        }

        if self.keep_alive_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Keep alive timeout must be greater than 0"));
        }

        if self.keep_alive_timeout_seconds > 3600 {
            return Err(anyhow::anyhow!("Keep alive timeout cannot exceed 3600 seconds"));
        }

        if self.availability_timeout_ms == 0 || self.availability_timeout_ms > 30_000 {
            return Err(anyhow::anyhow!(
                "Availability timeout must be between 1 and 30000 milliseconds"
            ));
        }

        Ok(())
    }
}
