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

pub mod actions;
pub mod browser;
pub mod extractor;
pub mod stealth;

use crate::config::settings::EngineSettings;
use crate::engine::actions::{compile_actions, ActionSpec};
use crate::engine::browser::BrowserHandle;
use crate::engine::extractor::{default_extract, extract_fields, ExtractorSpec};
use crate::engine::stealth::FingerprintProfile;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use metrics::counter;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// 引擎错误类型
///
/// 这里的每个变体对本次任务尝试都是致命的；
/// 字段级的提取失败不会出现在这里，它们在提取器内部降级为null。
#[derive(Error, Debug)]
pub enum EngineError {
    /// 会话初始化失败
    #[error("Session init failed: {0}")]
    SessionInit(String),
    /// 导航失败
    #[error("Navigation failed: {0}")]
    Navigation(String),
    /// 导航超时
    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),
    /// 动作执行失败
    #[error("Action '{action}' failed on '{selector}': {detail}")]
    Action {
        action: &'static str,
        selector: String,
        detail: String,
    },
    /// 超时
    #[error("Timed out: {0}")]
    Timeout(String),
    /// 浏览器通信错误
    #[error("Browser error: {0}")]
    Browser(String),
}

/// 抓取请求
///
/// 工作器从任务配置构建，交给引擎执行一次完整会话。
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    /// 目标URL
    pub url: String,
    /// 动作序列
    pub actions: Vec<ActionSpec>,
    /// 提取器列表，为空时使用默认提取
    pub extractors: Vec<ExtractorSpec>,
    /// 提取前等待出现的选择器
    pub wait_for: Option<String>,
    /// 本次抓取的总超时时间
    pub timeout: Duration,
    /// 是否捕获整页截图
    pub screenshot: bool,
}

/// 抓取结果
///
/// 引擎边界上的类型化输出：要么是成功加数据，
/// 要么是失败加错误信息，从不向上传播异常。
#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    /// 是否成功
    pub success: bool,
    /// 提取器名称到提取值的映射
    pub data: Map<String, Value>,
    /// 失败时的错误信息
    pub error: Option<String>,
    /// 整页截图（base64编码）
    pub screenshot: Option<String>,
    /// 执行耗时（毫秒）
    pub duration_ms: u64,
    /// 重定向后的最终URL
    pub final_url: Option<String>,
}

/// 抓取执行引擎
///
/// 每次调用驱动一个任务的脚本化会话到完成：
/// 创建隔离的指纹随机化会话、按顺序执行解释动作、
/// 运行字段提取器，并保证会话在所有退出路径上被释放。
pub struct ScrapeEngine {
    browser: Arc<BrowserHandle>,
    settings: EngineSettings,
}

impl ScrapeEngine {
    /// 创建新的执行引擎
    ///
    /// # 参数
    ///
    /// * `browser` - 共享浏览器进程句柄
    /// * `settings` - 引擎配置
    pub fn new(browser: Arc<BrowserHandle>, settings: EngineSettings) -> Self {
        Self { browser, settings }
    }

    /// 执行一次抓取
    ///
    /// 状态机：Uninitialized → SessionOpen → Navigated →
    /// ActionsRunning → ExtractionRunning → Closed。
    /// Closed在成功和失败路径上都会到达。
    ///
    /// # 参数
    ///
    /// * `request` - 抓取请求
    ///
    /// # 返回值
    ///
    /// 类型化的抓取结果，错误一律转换为`success: false`
    pub async fn scrape(&self, request: &ScrapeRequest) -> ScrapeOutcome {
        let started = Instant::now();
        counter!("engine_scrapes_total").increment(1);

        match self.run_session(request).await {
            Ok((data, screenshot, final_url)) => ScrapeOutcome {
                success: true,
                data,
                error: None,
                screenshot,
                duration_ms: started.elapsed().as_millis() as u64,
                final_url,
            },
            Err(e) => {
                counter!("engine_scrapes_failed_total").increment(1);
                ScrapeOutcome {
                    success: false,
                    data: Map::new(),
                    error: Some(e.to_string()),
                    screenshot: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    final_url: None,
                }
            }
        }
    }

    async fn run_session(
        &self,
        request: &ScrapeRequest,
    ) -> Result<(Map<String, Value>, Option<String>, Option<String>), EngineError> {
        let profile = FingerprintProfile::random();
        let page = self.browser.new_stealth_page(&profile).await?;
        debug!(
            "Session opened: {}x{} {}",
            profile.viewport_width, profile.viewport_height, profile.timezone
        );

        let result = tokio::time::timeout(request.timeout, self.drive(&page, request))
            .await
            .unwrap_or_else(|_| Err(EngineError::Timeout("scrape exceeded job timeout".into())));

        // the session is torn down on every exit path
        if let Err(e) = page.close().await {
            warn!("Failed to close page: {}", e);
        }

        result
    }

    async fn drive(
        &self,
        page: &Page,
        request: &ScrapeRequest,
    ) -> Result<(Map<String, Value>, Option<String>, Option<String>), EngineError> {
        let nav_timeout = Duration::from_secs(self.settings.navigation_timeout_secs);
        match tokio::time::timeout(nav_timeout, page.goto(&request.url)).await {
            Err(_) => return Err(EngineError::NavigationTimeout(nav_timeout)),
            Ok(Err(e)) => return Err(EngineError::Navigation(e.to_string())),
            Ok(Ok(_)) => {}
        }

        let element_timeout = Duration::from_secs(self.settings.action_timeout_secs);
        for action in compile_actions(&request.actions) {
            let result = actions::run_action(page, &action, element_timeout).await;

            // human pacing between steps, inserted regardless of outcome
            let pause = rand::random_range(500..1500);
            tokio::time::sleep(Duration::from_millis(pause)).await;

            result?;
        }

        if let Some(selector) = &request.wait_for {
            let wait_timeout = Duration::from_secs(self.settings.wait_for_timeout_secs);
            actions::wait_for_selector(page, selector, wait_timeout).await?;
        }

        let html = page
            .content()
            .await
            .map_err(|e| EngineError::Browser(e.to_string()))?;
        let final_url = self.current_url(page).await;

        let data = if request.extractors.is_empty() {
            default_extract(&html, final_url.as_deref().unwrap_or(&request.url))
        } else {
            extract_fields(&html, &request.extractors)
        };

        let screenshot = if request.screenshot {
            self.capture_screenshot(page).await
        } else {
            None
        };

        Ok((data, screenshot, final_url))
    }

    async fn current_url(&self, page: &Page) -> Option<String> {
        page.evaluate("window.location.href")
            .await
            .ok()
            .and_then(|result| result.into_value::<String>().ok())
    }

    // screenshot failures are operational: logged, never fatal to the scrape
    async fn capture_screenshot(&self, page: &Page) -> Option<String> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(80)
            .full_page(true)
            .build();

        match page.screenshot(params).await {
            Ok(bytes) => Some(BASE64.encode(bytes)),
            Err(e) => {
                warn!("Screenshot capture failed: {}", e);
                None
            }
        }
    }
}
