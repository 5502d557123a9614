// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::ProxySettings;
use crate::domain::models::proxy::{Proxy, ProxyStatus};
use crate::domain::repositories::proxy_repository::ProxyRepository;
use crate::proxy::health::probe_proxy;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 轮询状态
///
/// 代理列表、旋转游标和本地失败集合的唯一归属地。
/// 失败集合在每次load_proxies时重建，在全部耗尽时被清空。
struct RotationState {
    proxies: Vec<Proxy>,
    cursor: usize,
    failed: HashSet<Uuid>,
}

/// 代理选择器与健康跟踪器
///
/// 负责分发可用代理、跟踪可靠性并隔离失败代理而不永久丢失它们。
/// 所有选择和上报操作在并发工作器之间是安全的：
/// 旋转游标和失败集合的变更由互斥锁保护，
/// 可靠性计数器更新是针对外部存储的读-改-写，容忍最后写入者胜出。
#[derive(Clone)]
pub struct ProxySelector {
    repository: Arc<dyn ProxyRepository>,
    state: Arc<Mutex<RotationState>>,
    settings: ProxySettings,
}

impl ProxySelector {
    /// 创建新的代理选择器
    ///
    /// # 参数
    ///
    /// * `repository` - 代理仓库
    /// * `settings` - 代理池配置
    pub fn new(repository: Arc<dyn ProxyRepository>, settings: ProxySettings) -> Self {
        Self {
            repository,
            state: Arc::new(Mutex::new(RotationState {
                proxies: Vec::new(),
                cursor: 0,
                failed: HashSet::new(),
            })),
            settings,
        }
    }

    /// 从存储加载所有活跃代理
    ///
    /// 替换内存中的代理列表并清空本地失败集合。
    /// 软失败：存储错误时列表变为空，后续选择返回
    /// "无可用代理"而不是抛出错误。
    pub async fn load_proxies(&self) -> usize {
        let proxies = match self.repository.find_active().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to load proxies, pool is now empty: {}", e);
                Vec::new()
            }
        };

        let count = proxies.len();
        let mut state = self.state.lock();
        state.proxies = proxies;
        state.cursor = 0;
        state.failed.clear();
        gauge!("proxy_pool_size").set(count as f64);
        info!("Loaded {} active proxies", count);
        count
    }

    /// 轮询选择下一个可用代理
    ///
    /// 沿旋转游标前进，跳过：本地失败集合中的代理、
    /// 国家被排除的代理、以及成功率过低的代理
    /// （rate < 阈值 且 total > 最小请求数）。
    /// 探测次数以2×列表长度为界保证终止。
    ///
    /// 当所有代理都被排除时进入最后手段回退：清空失败集合
    /// 并返回成功率最高的代理，防止完全饥饿。
    ///
    /// # 参数
    ///
    /// * `exclude_countries` - 需要排除的国家代码
    ///
    /// # 返回值
    ///
    /// * `Some(Proxy)` - 选中的代理
    /// * `None` - 代理列表为空
    pub fn select_next(&self, exclude_countries: &[String]) -> Option<Proxy> {
        let mut state = self.state.lock();
        if state.proxies.is_empty() {
            return None;
        }

        let len = state.proxies.len();
        for _ in 0..(2 * len) {
            let idx = state.cursor % len;
            state.cursor = state.cursor.wrapping_add(1);

            let proxy = &state.proxies[idx];
            if state.failed.contains(&proxy.id) {
                continue;
            }
            if let Some(country) = &proxy.country {
                if exclude_countries.iter().any(|c| c.eq_ignore_ascii_case(country)) {
                    continue;
                }
            }
            if proxy.success_rate < self.settings.skip_rate_threshold
                && proxy.total_requests > self.settings.skip_min_requests
            {
                continue;
            }

            counter!("proxy_selections_total").increment(1);
            return Some(proxy.clone());
        }

        // every proxy is excluded: clear quarantines and hand out the single
        // best proxy rather than starving callers entirely
        warn!("All proxies quarantined or filtered, falling back to best proxy");
        counter!("proxy_exhausted_fallback_total").increment(1);
        state.failed.clear();
        gauge!("proxy_quarantined").set(0.0);

        state
            .proxies
            .iter()
            .max_by(|a, b| {
                a.success_rate
                    .partial_cmp(&b.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// 选择指定国家中成功率最高的非隔离代理
    ///
    /// # 参数
    ///
    /// * `code` - 国家代码
    ///
    /// # 返回值
    ///
    /// * `Some(Proxy)` - 匹配的代理
    /// * `None` - 没有匹配
    pub fn select_by_country(&self, code: &str) -> Option<Proxy> {
        let state = self.state.lock();
        state
            .proxies
            .iter()
            .filter(|p| {
                p.country
                    .as_deref()
                    .map(|c| c.eq_ignore_ascii_case(code))
                    .unwrap_or(false)
            })
            .filter(|p| !state.failed.contains(&p.id))
            .max_by(|a, b| {
                a.success_rate
                    .partial_cmp(&b.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// 上报一次代理失败
    ///
    /// 先同步加入本地失败集合（下一次选择立即排除），
    /// 再更新持久化的可靠性计数器，并在隔离窗口后
    /// 安排一次单独的复查。
    ///
    /// # 参数
    ///
    /// * `proxy_id` - 代理ID
    /// * `reason` - 失败原因
    pub async fn report_failure(&self, proxy_id: Uuid, reason: &str) {
        {
            let mut state = self.state.lock();
            state.failed.insert(proxy_id);
            gauge!("proxy_quarantined").set(state.failed.len() as f64);
        }
        counter!("proxy_failures_total").increment(1);
        debug!("Proxy {} quarantined: {}", proxy_id, reason);

        self.apply_failure(proxy_id).await;
        self.schedule_recheck(proxy_id);
    }

    /// 上报一次代理成功
    ///
    /// 从本地失败集合移除，并将响应时间折入持久化的运行平均值。
    ///
    /// # 参数
    ///
    /// * `proxy_id` - 代理ID
    /// * `response_ms` - 本次请求的响应时间（毫秒）
    pub async fn report_success(&self, proxy_id: Uuid, response_ms: u64) {
        {
            let mut state = self.state.lock();
            state.failed.remove(&proxy_id);
            gauge!("proxy_quarantined").set(state.failed.len() as f64);
        }

        if let Some(updated) = self
            .update_persisted(proxy_id, |proxy| {
                proxy.record_success(response_ms);
                false
            })
            .await
        {
            self.sync_in_memory(updated);
        }
    }

    /// 当前已加载代理的快照（含隔离中的代理），供健康巡检采样
    pub fn known_proxies(&self) -> Vec<Proxy> {
        self.state.lock().proxies.clone()
    }

    async fn apply_failure(&self, proxy_id: Uuid) {
        let min_requests = self.settings.auto_disable_min_requests;
        let disable_rate = self.settings.auto_disable_rate;

        if let Some(updated) = self
            .update_persisted(proxy_id, move |proxy| {
                proxy.record_failure(min_requests, disable_rate)
            })
            .await
        {
            if updated.status == ProxyStatus::Disabled {
                warn!(
                    "Proxy {} auto-disabled: rate {:.3} over {} requests",
                    proxy_id, updated.success_rate, updated.total_requests
                );
                counter!("proxy_auto_disabled_total").increment(1);
            }
            self.sync_in_memory(updated);
        }
    }

    // read-modify-write of the persisted reliability counters; storage errors
    // are logged and swallowed, they must never affect the job that triggered them
    async fn update_persisted(
        &self,
        proxy_id: Uuid,
        mutate: impl FnOnce(&mut Proxy) -> bool,
    ) -> Option<Proxy> {
        let mut proxy = match self.repository.find_by_id(proxy_id).await {
            Ok(Some(proxy)) => proxy,
            Ok(None) => {
                debug!("Proxy {} no longer exists, skipping update", proxy_id);
                return None;
            }
            Err(e) => {
                warn!("Failed to read proxy {} for update: {}", proxy_id, e);
                return None;
            }
        };

        mutate(&mut proxy);

        match self.repository.update(&proxy).await {
            Ok(updated) => Some(updated),
            Err(e) => {
                warn!("Failed to persist reliability update for {}: {}", proxy_id, e);
                None
            }
        }
    }

    // keep the in-memory rotation copy roughly in step between reloads;
    // a proxy disabled by the reliability update leaves the rotation at once
    fn sync_in_memory(&self, updated: Proxy) {
        let mut state = self.state.lock();
        if updated.status == ProxyStatus::Disabled {
            state.proxies.retain(|p| p.id != updated.id);
            gauge!("proxy_pool_size").set(state.proxies.len() as f64);
            return;
        }
        if let Some(existing) = state.proxies.iter_mut().find(|p| p.id == updated.id) {
            *existing = updated;
        }
    }

    // solitary re-check after the quarantine window so a recovered proxy
    // does not stay stuck in the failure set
    fn schedule_recheck(&self, proxy_id: Uuid) {
        let selector = self.clone();
        let quarantine = Duration::from_secs(self.settings.quarantine_secs);

        tokio::spawn(async move {
            tokio::time::sleep(quarantine).await;

            let proxy = match selector.repository.find_by_id(proxy_id).await {
                Ok(Some(proxy)) if proxy.status == ProxyStatus::Active => proxy,
                Ok(_) => return,
                Err(e) => {
                    debug!("Quarantine re-check skipped for {}: {}", proxy_id, e);
                    return;
                }
            };

            let timeout = Duration::from_secs(selector.settings.probe_timeout_secs);
            match probe_proxy(&proxy, &selector.settings.probe_url, timeout).await {
                Ok(response_ms) => {
                    info!("Quarantined proxy {} recovered in re-check", proxy_id);
                    selector.report_success(proxy_id, response_ms).await;
                }
                Err(e) => {
                    debug!("Quarantined proxy {} still failing: {}", proxy_id, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::proxy::ProxyScheme;
    use crate::domain::repositories::job_repository::RepositoryError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;

    struct InMemoryProxyRepository {
        proxies: Mutex<HashMap<Uuid, Proxy>>,
        fail_reads: bool,
    }

    impl InMemoryProxyRepository {
        fn new(proxies: Vec<Proxy>) -> Self {
            Self {
                proxies: Mutex::new(proxies.into_iter().map(|p| (p.id, p)).collect()),
                fail_reads: false,
            }
        }

        fn failing() -> Self {
            Self {
                proxies: Mutex::new(HashMap::new()),
                fail_reads: true,
            }
        }
    }

    #[async_trait]
    impl ProxyRepository for InMemoryProxyRepository {
        async fn find_active(&self) -> Result<Vec<Proxy>, RepositoryError> {
            if self.fail_reads {
                return Err(RepositoryError::NotFound);
            }
            let mut list: Vec<Proxy> = self
                .proxies
                .lock()
                .values()
                .filter(|p| p.status == ProxyStatus::Active)
                .cloned()
                .collect();
            list.sort_by(|a, b| b.success_rate.partial_cmp(&a.success_rate).unwrap());
            Ok(list)
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<Proxy>, RepositoryError> {
            Ok(self.proxies.lock().get(&id).cloned())
        }

        async fn update(&self, proxy: &Proxy) -> Result<Proxy, RepositoryError> {
            self.proxies.lock().insert(proxy.id, proxy.clone());
            Ok(proxy.clone())
        }
    }

    fn proxy(country: &str, success_rate: f64, total_requests: i64) -> Proxy {
        let successful = (success_rate * total_requests as f64).round() as i64;
        Proxy {
            id: Uuid::new_v4(),
            host: "10.0.0.1".to_string(),
            port: 3128,
            username: None,
            password: None,
            scheme: ProxyScheme::Http,
            country: Some(country.to_string()),
            provider: None,
            status: ProxyStatus::Active,
            success_rate,
            total_requests,
            successful_requests: successful,
            failed_requests: total_requests - successful,
            avg_response_ms: 100.0,
            last_used: None,
            last_status: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    fn settings() -> ProxySettings {
        ProxySettings {
            skip_rate_threshold: 0.5,
            skip_min_requests: 10,
            auto_disable_rate: 0.1,
            auto_disable_min_requests: 20,
            quarantine_secs: 300,
            health_interval_secs: 600,
            health_sample_size: 5,
            probe_url: "https://www.gstatic.com/generate_204".to_string(),
            probe_timeout_secs: 10,
        }
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let proxies = vec![proxy("US", 0.9, 50), proxy("DE", 0.8, 50)];
        let ids: Vec<Uuid> = proxies.iter().map(|p| p.id).collect();
        let selector =
            ProxySelector::new(Arc::new(InMemoryProxyRepository::new(proxies)), settings());
        selector.load_proxies().await;

        let first = selector.select_next(&[]).unwrap();
        let second = selector.select_next(&[]).unwrap();
        let third = selector.select_next(&[]).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.id, third.id);
        assert!(ids.contains(&first.id));
    }

    #[tokio::test]
    async fn test_unreliable_proxy_skipped() {
        let good = proxy("US", 0.9, 50);
        let bad = proxy("US", 0.2, 50);
        let bad_id = bad.id;
        let selector = ProxySelector::new(
            Arc::new(InMemoryProxyRepository::new(vec![good, bad])),
            settings(),
        );
        selector.load_proxies().await;

        for _ in 0..10 {
            let selected = selector.select_next(&[]).unwrap();
            assert_ne!(selected.id, bad_id);
        }
    }

    #[tokio::test]
    async fn test_low_rate_with_few_requests_still_selectable() {
        // below the rate threshold but not past the request minimum
        let fresh = proxy("US", 0.0, 5);
        let fresh_id = fresh.id;
        let selector = ProxySelector::new(
            Arc::new(InMemoryProxyRepository::new(vec![fresh])),
            settings(),
        );
        selector.load_proxies().await;

        assert_eq!(selector.select_next(&[]).unwrap().id, fresh_id);
    }

    #[tokio::test]
    async fn test_country_exclusion() {
        let us = proxy("US", 0.9, 50);
        let de = proxy("DE", 0.9, 50);
        let de_id = de.id;
        let selector = ProxySelector::new(
            Arc::new(InMemoryProxyRepository::new(vec![us, de])),
            settings(),
        );
        selector.load_proxies().await;

        for _ in 0..6 {
            let selected = selector.select_next(&["US".to_string()]).unwrap();
            assert_eq!(selected.id, de_id);
        }
    }

    #[tokio::test]
    async fn test_reported_failure_excluded_immediately() {
        let a = proxy("US", 0.9, 50);
        let b = proxy("US", 0.8, 50);
        let a_id = a.id;
        let selector = ProxySelector::new(
            Arc::new(InMemoryProxyRepository::new(vec![a, b])),
            settings(),
        );
        selector.load_proxies().await;

        selector.report_failure(a_id, "connection refused").await;
        for _ in 0..4 {
            assert_ne!(selector.select_next(&[]).unwrap().id, a_id);
        }
    }

    #[tokio::test]
    async fn test_success_requalifies_quarantined_proxy() {
        let a = proxy("US", 0.9, 50);
        let a_id = a.id;
        let selector =
            ProxySelector::new(Arc::new(InMemoryProxyRepository::new(vec![a])), settings());
        selector.load_proxies().await;

        selector.report_failure(a_id, "timeout").await;
        selector.report_success(a_id, 120).await;

        assert_eq!(selector.select_next(&[]).unwrap().id, a_id);
    }

    #[tokio::test]
    async fn test_exhaustion_fallback_returns_best() {
        let a = proxy("US", 0.9, 50);
        let b = proxy("US", 0.7, 50);
        let a_id = a.id;
        let b_id = b.id;
        let selector = ProxySelector::new(
            Arc::new(InMemoryProxyRepository::new(vec![a, b])),
            settings(),
        );
        selector.load_proxies().await;

        selector.report_failure(a_id, "err").await;
        selector.report_failure(b_id, "err").await;

        // both quarantined: fallback clears the set and returns the best one
        let selected = selector.select_next(&[]).unwrap();
        assert_eq!(selected.id, a_id);
    }

    #[tokio::test]
    async fn test_empty_pool_returns_none() {
        let selector = ProxySelector::new(
            Arc::new(InMemoryProxyRepository::new(Vec::new())),
            settings(),
        );
        selector.load_proxies().await;
        assert!(selector.select_next(&[]).is_none());
    }

    #[tokio::test]
    async fn test_storage_error_degrades_to_empty_pool() {
        let selector =
            ProxySelector::new(Arc::new(InMemoryProxyRepository::failing()), settings());
        let loaded = selector.load_proxies().await;

        assert_eq!(loaded, 0);
        assert!(selector.select_next(&[]).is_none());
    }

    #[tokio::test]
    async fn test_select_by_country_prefers_best_rate() {
        let slow = proxy("DE", 0.6, 50);
        let fast = proxy("DE", 0.95, 50);
        let other = proxy("US", 0.99, 50);
        let fast_id = fast.id;
        let selector = ProxySelector::new(
            Arc::new(InMemoryProxyRepository::new(vec![slow, fast, other])),
            settings(),
        );
        selector.load_proxies().await;

        assert_eq!(selector.select_by_country("de").unwrap().id, fast_id);
        assert!(selector.select_by_country("JP").is_none());
    }

    #[tokio::test]
    async fn test_auto_disable_leaves_rotation() {
        let mut bad = proxy("US", 0.05, 20);
        bad.successful_requests = 1;
        bad.failed_requests = 19;
        let bad_id = bad.id;
        let repo = Arc::new(InMemoryProxyRepository::new(vec![bad]));
        let selector = ProxySelector::new(repo.clone(), settings());
        selector.load_proxies().await;

        // the 21st request trips the auto-disable threshold
        selector.report_failure(bad_id, "err").await;

        let stored = repo.find_by_id(bad_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProxyStatus::Disabled);
        assert_eq!(stored.total_requests, 21);
        assert!(selector.select_next(&[]).is_none());
    }

    #[tokio::test]
    async fn test_success_rate_converges_exactly() {
        let p = proxy("US", 0.0, 0);
        let id = p.id;
        let repo = Arc::new(InMemoryProxyRepository::new(vec![p]));
        let selector = ProxySelector::new(repo.clone(), settings());
        selector.load_proxies().await;

        for _ in 0..6 {
            selector.report_success(id, 100).await;
        }
        for _ in 0..4 {
            selector.report_failure(id, "err").await;
        }

        let stored = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.total_requests, 10);
        assert!((stored.success_rate - 0.6).abs() < 1e-9);
    }
}
