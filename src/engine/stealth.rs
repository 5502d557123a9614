// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use rand::prelude::*;

/// 常见桌面视口尺寸
const VIEWPORTS: &[(i64, i64)] = &[
    (1920, 1080),
    (1680, 1050),
    (1600, 900),
    (1536, 864),
    (1440, 900),
    (1366, 768),
];

/// 桌面浏览器User-Agent池
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// 地区配置：(locale, 时区, Accept-Language)
const LOCALES: &[(&str, &str, &str)] = &[
    ("en-US", "America/New_York", "en-US,en;q=0.9"),
    ("en-US", "America/Chicago", "en-US,en;q=0.9"),
    ("en-US", "America/Los_Angeles", "en-US,en;q=0.9"),
    ("en-GB", "Europe/London", "en-GB,en;q=0.9"),
    ("de-DE", "Europe/Berlin", "de-DE,de;q=0.9,en;q=0.8"),
];

/// 会话指纹配置
///
/// 每个会话随机生成一次，会话期间保持不变。
/// 目的是降低自动化检测信号，不是安全边界。
#[derive(Debug, Clone)]
pub struct FingerprintProfile {
    /// 视口宽度
    pub viewport_width: i64,
    /// 视口高度
    pub viewport_height: i64,
    /// User-Agent字符串
    pub user_agent: String,
    /// locale标识
    pub locale: String,
    /// IANA时区标识
    pub timezone: String,
    /// Accept-Language请求头
    pub accept_language: String,
}

impl FingerprintProfile {
    /// 随机生成一个会话指纹
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let (viewport_width, viewport_height) = *VIEWPORTS.choose(&mut rng).expect("non-empty");
        let user_agent = USER_AGENTS.choose(&mut rng).expect("non-empty").to_string();
        let (locale, timezone, accept_language) = *LOCALES.choose(&mut rng).expect("non-empty");

        Self {
            viewport_width,
            viewport_height,
            user_agent,
            locale: locale.to_string(),
            timezone: timezone.to_string(),
            accept_language: accept_language.to_string(),
        }
    }
}

/// 注入到每个新文档的反检测脚本
///
/// 覆盖最常被反爬虫探测的自动化信号。
pub const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', {
    get: () => [1, 2, 3, 4, 5],
});
Object.defineProperty(navigator, 'languages', {
    get: () => ['en-US', 'en'],
});
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions.query;
window.navigator.permissions.query = (parameters) =>
    parameters.name === 'notifications'
        ? Promise.resolve({ state: Notification.permission })
        : originalQuery(parameters);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_draws_from_known_pools() {
        for _ in 0..20 {
            let profile = FingerprintProfile::random();
            assert!(VIEWPORTS
                .iter()
                .any(|(w, h)| *w == profile.viewport_width && *h == profile.viewport_height));
            assert!(USER_AGENTS.contains(&profile.user_agent.as_str()));
            assert!(LOCALES.iter().any(|(l, t, a)| *l == profile.locale
                && *t == profile.timezone
                && *a == profile.accept_language));
        }
    }

    #[test]
    fn test_user_agents_are_desktop() {
        for ua in USER_AGENTS {
            assert!(!ua.contains("Mobile"));
            assert!(!ua.contains("iPhone"));
        }
    }
}
