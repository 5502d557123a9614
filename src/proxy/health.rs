// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::ProxySettings;
use crate::domain::models::proxy::Proxy;
use crate::proxy::selector::ProxySelector;
use anyhow::Result;
use metrics::counter;
use rand::prelude::*;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 代理健康巡检器
///
/// 按固定间隔对已知代理随机采样并发起轻量出站探测，
/// 探测结果回流到选择器的成功/失败上报。
/// 这让被隔离但实际已恢复的代理不会永远卡住，
/// 也能发现最近未被使用代理的静默退化。
pub struct ProxyHealthMonitor {
    selector: ProxySelector,
    settings: ProxySettings,
}

impl ProxyHealthMonitor {
    /// 创建新的健康巡检器
    ///
    /// # 参数
    ///
    /// * `selector` - 代理选择器
    /// * `settings` - 代理池配置
    pub fn new(selector: ProxySelector, settings: ProxySettings) -> Self {
        Self { selector, settings }
    }

    /// 启动后台巡检任务
    ///
    /// # 返回值
    ///
    /// 返回后台任务的句柄
    pub fn start(&self) -> JoinHandle<()> {
        let selector = self.selector.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(settings.health_interval_secs));
            // the immediate first tick would probe before anything is loaded
            interval.tick().await;

            loop {
                interval.tick().await;

                let proxies = selector.known_proxies();
                if proxies.is_empty() {
                    continue;
                }

                let sample: Vec<Proxy> = {
                    let mut rng = rand::rng();
                    proxies
                        .choose_multiple(&mut rng, settings.health_sample_size)
                        .cloned()
                        .collect()
                };

                debug!("Health sweep probing {} proxies", sample.len());
                for proxy in sample {
                    let timeout = Duration::from_secs(settings.probe_timeout_secs);
                    match probe_proxy(&proxy, &settings.probe_url, timeout).await {
                        Ok(response_ms) => {
                            counter!("proxy_probe_success_total").increment(1);
                            selector.report_success(proxy.id, response_ms).await;
                        }
                        Err(e) => {
                            counter!("proxy_probe_failure_total").increment(1);
                            debug!("Health probe failed for {}: {}", proxy.id, e);
                            selector.report_failure(proxy.id, &e.to_string()).await;
                        }
                    }
                }
            }
        })
    }
}

/// 通过代理发起一次轻量出站探测
///
/// # 参数
///
/// * `proxy` - 要探测的代理
/// * `probe_url` - 探测目标URL
/// * `timeout` - 探测超时时间
///
/// # 返回值
///
/// * `Ok(u64)` - 探测成功，返回响应时间（毫秒）
/// * `Err` - 探测失败
pub async fn probe_proxy(proxy: &Proxy, probe_url: &str, timeout: Duration) -> Result<u64> {
    let started = Instant::now();

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(proxy.proxy_url())?)
        .timeout(timeout)
        .build()?;

    let response = client.get(probe_url).send().await?;
    let status = response.status();
    if !status.is_success() && !status.is_redirection() {
        anyhow::bail!("probe returned status {}", status);
    }

    let elapsed = started.elapsed().as_millis() as u64;
    info!("Proxy {} probe ok in {}ms", proxy.id, elapsed);
    Ok(elapsed)
}
