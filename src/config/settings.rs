// Copyright 2025 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// 应用程序配置设置
///
/// 包含数据库、工作器、重试、代理和引擎等所有配置项
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// 数据库配置
    pub database: DatabaseSettings,
    /// 工作器配置
    pub worker: WorkerSettings,
    /// 重试策略配置
    pub retry: RetrySettings,
    /// 代理池配置
    pub proxy: ProxySettings,
    /// 执行引擎配置
    pub engine: EngineSettings,
}

/// 数据库配置设置
#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    /// 数据库连接URL
    pub url: String,
    /// 最大连接数
    pub max_connections: Option<u32>,
    /// 最小连接数
    pub min_connections: Option<u32>,
    /// 连接超时时间（秒）
    pub connect_timeout: Option<u64>,
    /// 空闲连接超时时间（秒）
    pub idle_timeout: Option<u64>,
}

/// 工作器配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// 并发工作器数量
    pub concurrency: usize,
    /// 全局调度速率限制窗口（秒）
    pub dispatch_window_secs: u64,
    /// 窗口内允许的最大调度次数
    pub dispatch_count: u32,
    /// 批量入队时每个任务之间的间隔（毫秒）
    pub bulk_stagger_ms: u64,
}

/// 重试策略配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// 默认最大尝试次数
    pub max_attempts: i32,
    /// 初始退避时间（秒）
    pub backoff_base_secs: u64,
    /// 最大退避时间（秒）
    pub backoff_max_secs: u64,
}

/// 代理池配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// 轮询跳过的成功率阈值
    pub skip_rate_threshold: f64,
    /// 成功率阈值生效所需的最小请求数
    pub skip_min_requests: i64,
    /// 自动禁用的成功率阈值
    pub auto_disable_rate: f64,
    /// 自动禁用生效所需的最小请求数
    pub auto_disable_min_requests: i64,
    /// 失败代理的隔离窗口（秒）
    pub quarantine_secs: u64,
    /// 后台健康检查间隔（秒）
    pub health_interval_secs: u64,
    /// 每轮健康检查采样的代理数量
    pub health_sample_size: usize,
    /// 健康探测目标URL
    pub probe_url: String,
    /// 健康探测超时时间（秒）
    pub probe_timeout_secs: u64,
}

/// 执行引擎配置设置
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// 页面导航超时时间（秒）
    pub navigation_timeout_secs: u64,
    /// 单个动作等待元素的超时时间（秒）
    pub action_timeout_secs: u64,
    /// waitFor选择器的超时时间（秒）
    pub wait_for_timeout_secs: u64,
    /// 单次抓取的默认总超时时间（秒）
    pub default_timeout_secs: u64,
    /// Chromium远程调试地址（可选，不设置则本地启动）
    pub remote_debugging_url: Option<String>,
}

impl Settings {
    /// 创建新的配置实例
    ///
    /// 从环境变量加载配置，支持默认值
    ///
    /// # Returns
    ///
    /// * `Ok(Settings)` - 成功加载的配置
    /// * `Err(ConfigError)` - 配置加载失败
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "default".to_string());
        let builder = Config::builder()
            // Default DB pool settings
            .set_default("database.max_connections", 100)?
            .set_default("database.min_connections", 10)?
            .set_default("database.connect_timeout", 10)?
            .set_default("database.idle_timeout", 300)?
            // Default Worker settings
            .set_default("worker.concurrency", 3)?
            .set_default("worker.dispatch_window_secs", 60)?
            .set_default("worker.dispatch_count", 10)?
            .set_default("worker.bulk_stagger_ms", 250)?
            // Default Retry settings
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.backoff_base_secs", 1)?
            .set_default("retry.backoff_max_secs", 60)?
            // Default Proxy settings
            .set_default("proxy.skip_rate_threshold", 0.5)?
            .set_default("proxy.skip_min_requests", 10)?
            .set_default("proxy.auto_disable_rate", 0.1)?
            .set_default("proxy.auto_disable_min_requests", 20)?
            .set_default("proxy.quarantine_secs", 300)?
            .set_default("proxy.health_interval_secs", 600)?
            .set_default("proxy.health_sample_size", 5)?
            .set_default("proxy.probe_url", "https://www.gstatic.com/generate_204")?
            .set_default("proxy.probe_timeout_secs", 10)?
            // Default Engine settings
            .set_default("engine.navigation_timeout_secs", 30)?
            .set_default("engine.action_timeout_secs", 5)?
            .set_default("engine.wait_for_timeout_secs", 10)?
            .set_default("engine.default_timeout_secs", 60)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("HARVESTRS").separator("__"));

        builder.build()?.try_deserialize()
    }
}
