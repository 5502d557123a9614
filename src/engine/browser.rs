// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::EngineSettings;
use crate::engine::stealth::{FingerprintProfile, STEALTH_INIT_SCRIPT};
use crate::engine::EngineError;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

/// 共享浏览器进程句柄
///
/// 浏览器进程在首次使用时惰性启动，在所有任务间共享；
/// 每个任务拥有自己的独立页面作为隔离单元。
/// 句柄由流水线显式持有并在关闭时显式释放，
/// 而不是作为全局环境状态访问。
pub struct BrowserHandle {
    cell: OnceCell<Mutex<Browser>>,
    settings: EngineSettings,
}

impl BrowserHandle {
    /// 创建新的浏览器句柄
    ///
    /// 此时不会启动浏览器进程，首次创建页面时才会启动。
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            cell: OnceCell::new(),
            settings,
        }
    }

    /// 获取或惰性启动共享浏览器实例
    async fn browser(&self) -> Result<&Mutex<Browser>, EngineError> {
        self.cell
            .get_or_try_init(|| async {
                let (browser, mut handler) =
                    if let Some(url) = &self.settings.remote_debugging_url {
                        info!("Connecting to remote Chrome instance at: {}", url);
                        Browser::connect(url).await.map_err(|e| {
                            EngineError::SessionInit(format!(
                                "Failed to connect to remote Chrome: {}",
                                e
                            ))
                        })?
                    } else {
                        let config = BrowserConfig::builder()
                            .no_sandbox()
                            .request_timeout(Duration::from_secs(
                                self.settings.navigation_timeout_secs,
                            ))
                            .arg("--disable-gpu")
                            .arg("--disable-dev-shm-usage")
                            .arg("--disable-blink-features=AutomationControlled")
                            .build()
                            .map_err(EngineError::SessionInit)?;

                        Browser::launch(config)
                            .await
                            .map_err(|e| EngineError::SessionInit(e.to_string()))?
                    };

                // drain browser events on a background task
                tokio::spawn(async move {
                    while let Some(event) = handler.next().await {
                        if event.is_err() {
                            break;
                        }
                    }
                });

                info!("Browser process started");
                Ok(Mutex::new(browser))
            })
            .await
    }

    /// 打开一个新的隐身会话页面
    ///
    /// 每次调用创建一个全新页面并应用随机化的指纹表面：
    /// 视口、桌面User-Agent、时区、请求头以及抑制自动化
    /// 检测信号的初始化脚本。指纹在会话内保持不变。
    ///
    /// # 参数
    ///
    /// * `profile` - 本会话的指纹配置
    ///
    /// # 返回值
    ///
    /// * `Ok(Page)` - 已配置的新页面
    /// * `Err(EngineError)` - 会话初始化失败
    pub async fn new_stealth_page(
        &self,
        profile: &FingerprintProfile,
    ) -> Result<Page, EngineError> {
        let page = {
            let browser = self.browser().await?.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| EngineError::SessionInit(e.to_string()))?
        };

        page.set_user_agent(&profile.user_agent)
            .await
            .map_err(|e| EngineError::SessionInit(e.to_string()))?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(profile.viewport_width)
            .height(profile.viewport_height)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(EngineError::SessionInit)?;
        page.execute(metrics)
            .await
            .map_err(|e| EngineError::SessionInit(e.to_string()))?;

        let timezone = SetTimezoneOverrideParams::builder()
            .timezone_id(profile.timezone.clone())
            .build()
            .map_err(EngineError::SessionInit)?;
        page.execute(timezone)
            .await
            .map_err(|e| EngineError::SessionInit(e.to_string()))?;

        let headers = SetExtraHttpHeadersParams::builder()
            .headers(Headers::new(json!({
                "Accept-Language": profile.accept_language,
            })))
            .build()
            .map_err(EngineError::SessionInit)?;
        page.execute(headers)
            .await
            .map_err(|e| EngineError::SessionInit(e.to_string()))?;

        let init_script = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(STEALTH_INIT_SCRIPT)
            .build()
            .map_err(EngineError::SessionInit)?;
        page.execute(init_script)
            .await
            .map_err(|e| EngineError::SessionInit(e.to_string()))?;

        Ok(page)
    }

    /// 关闭浏览器进程
    ///
    /// 只有在浏览器已经启动过时才会关闭；关闭失败被记录但不传播。
    pub async fn close(&self) {
        if let Some(browser) = self.cell.get() {
            let mut browser = browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {}", e);
            }
        }
    }
}
