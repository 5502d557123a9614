// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::engine::EngineError;
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// 每字符默认输入延迟（typeHuman）
const HUMAN_TYPE_DELAY_MS: u64 = 80;
/// wait/waitAndClick的默认等待超时
const DEFAULT_WAIT_MS: u64 = 5000;

/// 脚本化动作的原始形式
///
/// 任务配置中的一步浏览器交互，按`type`字段解释。
/// 未知类型在编译时被跳过，不会中断动作序列。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// 动作类型
    #[serde(rename = "type")]
    pub action_type: String,
    /// 目标元素选择器
    #[serde(default)]
    pub selector: Option<String>,
    /// 输入值（type/typeHuman/select/keyPress使用）
    #[serde(default)]
    pub value: Option<String>,
    /// 每字符延迟（毫秒，typeHuman使用）
    #[serde(default)]
    pub delay: Option<u64>,
    /// 等待时间（毫秒，wait/waitAndClick使用）
    #[serde(default)]
    pub wait_time: Option<u64>,
}

/// 已编译的脚本化动作
///
/// 封闭的动作词汇表，每个变体对应解释器中的一个处理分支。
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedAction {
    Click { selector: String },
    Type { selector: String, value: String },
    TypeHuman { selector: String, value: String, delay_ms: u64 },
    Scroll { selector: Option<String> },
    ScrollToBottom,
    Wait { selector: String, timeout_ms: u64 },
    WaitAndClick { selector: String, timeout_ms: u64 },
    Hover { selector: String },
    Select { selector: String, value: String },
    KeyPress { selector: Option<String>, key: String },
    WaitForNavigation,
}

impl ScriptedAction {
    /// 动作类型名称，用于日志和错误信息
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptedAction::Click { .. } => "click",
            ScriptedAction::Type { .. } => "type",
            ScriptedAction::TypeHuman { .. } => "typeHuman",
            ScriptedAction::Scroll { .. } => "scroll",
            ScriptedAction::ScrollToBottom => "scrollToBottom",
            ScriptedAction::Wait { .. } => "wait",
            ScriptedAction::WaitAndClick { .. } => "waitAndClick",
            ScriptedAction::Hover { .. } => "hover",
            ScriptedAction::Select { .. } => "select",
            ScriptedAction::KeyPress { .. } => "keyPress",
            ScriptedAction::WaitForNavigation => "waitForNavigation",
        }
    }

    /// 涉及的选择器，用于错误信息
    pub fn selector(&self) -> &str {
        match self {
            ScriptedAction::Click { selector }
            | ScriptedAction::Type { selector, .. }
            | ScriptedAction::TypeHuman { selector, .. }
            | ScriptedAction::Wait { selector, .. }
            | ScriptedAction::WaitAndClick { selector, .. }
            | ScriptedAction::Hover { selector }
            | ScriptedAction::Select { selector, .. } => selector,
            ScriptedAction::Scroll { selector } | ScriptedAction::KeyPress { selector, .. } => {
                selector.as_deref().unwrap_or("")
            }
            _ => "",
        }
    }
}

/// 将原始动作编译为已知动作词汇表
///
/// 未知类型或缺少必填字段的动作被记录并跳过，
/// 其余动作保持原有顺序。
pub fn compile_actions(specs: &[ActionSpec]) -> Vec<ScriptedAction> {
    specs.iter().filter_map(compile_action).collect()
}

fn compile_action(spec: &ActionSpec) -> Option<ScriptedAction> {
    let selector = || spec.selector.clone();
    let value = || spec.value.clone();

    let compiled = match spec.action_type.as_str() {
        "click" => selector().map(|selector| ScriptedAction::Click { selector }),
        "type" => match (selector(), value()) {
            (Some(selector), Some(value)) => Some(ScriptedAction::Type { selector, value }),
            _ => None,
        },
        "typeHuman" => match (selector(), value()) {
            (Some(selector), Some(value)) => Some(ScriptedAction::TypeHuman {
                selector,
                value,
                delay_ms: spec.delay.unwrap_or(HUMAN_TYPE_DELAY_MS),
            }),
            _ => None,
        },
        "scroll" => Some(ScriptedAction::Scroll { selector: selector() }),
        "scrollToBottom" => Some(ScriptedAction::ScrollToBottom),
        "wait" => selector().map(|selector| ScriptedAction::Wait {
            selector,
            timeout_ms: spec.wait_time.unwrap_or(DEFAULT_WAIT_MS),
        }),
        "waitAndClick" => selector().map(|selector| ScriptedAction::WaitAndClick {
            selector,
            timeout_ms: spec.wait_time.unwrap_or(DEFAULT_WAIT_MS),
        }),
        "hover" => selector().map(|selector| ScriptedAction::Hover { selector }),
        "select" => match (selector(), value()) {
            (Some(selector), Some(value)) => Some(ScriptedAction::Select { selector, value }),
            _ => None,
        },
        "keyPress" => value().map(|key| ScriptedAction::KeyPress {
            selector: selector(),
            key,
        }),
        "waitForNavigation" => Some(ScriptedAction::WaitForNavigation),
        unknown => {
            warn!("Unknown action type '{}', skipped", unknown);
            return None;
        }
    };

    if compiled.is_none() {
        warn!(
            "Action '{}' is missing required fields, skipped",
            spec.action_type
        );
    }
    compiled
}

/// 等待选择器出现并返回匹配的元素
///
/// 以固定间隔轮询DOM，直到元素出现或超时。
pub async fn wait_for_selector(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> Result<Element, EngineError> {
    tokio::time::timeout(timeout, async {
        loop {
            match page.find_element(selector).await {
                Ok(element) => return element,
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    })
    .await
    .map_err(|_| EngineError::Timeout(format!("selector '{}' did not appear", selector)))
}

/// 执行单个已编译动作
///
/// # 参数
///
/// * `page` - 目标页面
/// * `action` - 要执行的动作
/// * `element_timeout` - 等待目标元素出现的超时时间
///
/// # 返回值
///
/// * `Ok(())` - 动作执行成功
/// * `Err(EngineError)` - 动作失败（对本次任务是致命的）
pub async fn run_action(
    page: &Page,
    action: &ScriptedAction,
    element_timeout: Duration,
) -> Result<(), EngineError> {
    let fail = |detail: String| EngineError::Action {
        action: action.kind(),
        selector: action.selector().to_string(),
        detail,
    };

    match action {
        ScriptedAction::Click { selector } => {
            let element = wait_for_selector(page, selector, element_timeout)
                .await
                .map_err(|e| fail(e.to_string()))?;
            element.click().await.map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::Type { selector, value } => {
            let element = wait_for_selector(page, selector, element_timeout)
                .await
                .map_err(|e| fail(e.to_string()))?;
            element.click().await.map_err(|e| fail(e.to_string()))?;
            element
                .type_str(value)
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::TypeHuman {
            selector,
            value,
            delay_ms,
        } => {
            let element = wait_for_selector(page, selector, element_timeout)
                .await
                .map_err(|e| fail(e.to_string()))?;
            element.click().await.map_err(|e| fail(e.to_string()))?;
            // one character at a time with per-character pacing
            for ch in value.chars() {
                element
                    .type_str(ch.to_string())
                    .await
                    .map_err(|e| fail(e.to_string()))?;
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
        }
        ScriptedAction::Scroll { selector } => match selector {
            Some(selector) => {
                let element = wait_for_selector(page, selector, element_timeout)
                    .await
                    .map_err(|e| fail(e.to_string()))?;
                element
                    .scroll_into_view()
                    .await
                    .map_err(|e| fail(e.to_string()))?;
            }
            None => {
                page.evaluate("window.scrollBy(0, window.innerHeight);")
                    .await
                    .map_err(|e| fail(e.to_string()))?;
            }
        },
        ScriptedAction::ScrollToBottom => {
            page.evaluate("window.scrollTo(0, document.body.scrollHeight);")
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::Wait {
            selector,
            timeout_ms,
        } => {
            wait_for_selector(page, selector, Duration::from_millis(*timeout_ms))
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::WaitAndClick {
            selector,
            timeout_ms,
        } => {
            let element = wait_for_selector(page, selector, Duration::from_millis(*timeout_ms))
                .await
                .map_err(|e| fail(e.to_string()))?;
            element.click().await.map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::Hover { selector } => {
            wait_for_selector(page, selector, element_timeout)
                .await
                .map_err(|e| fail(e.to_string()))?;
            let script = format!(
                "document.querySelector({})?.dispatchEvent(new MouseEvent('mouseover', {{bubbles: true}}));",
                js_string(selector)
            );
            page.evaluate(script)
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::Select { selector, value } => {
            wait_for_selector(page, selector, element_timeout)
                .await
                .map_err(|e| fail(e.to_string()))?;
            let script = format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return false;
                    el.value = {val};
                    el.dispatchEvent(new Event('input', {{bubbles: true}}));
                    el.dispatchEvent(new Event('change', {{bubbles: true}}));
                    return true;
                }})()"#,
                sel = js_string(selector),
                val = js_string(value)
            );
            page.evaluate(script)
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::KeyPress { selector, key } => {
            if let Some(selector) = selector {
                let element = wait_for_selector(page, selector, element_timeout)
                    .await
                    .map_err(|e| fail(e.to_string()))?;
                element.click().await.map_err(|e| fail(e.to_string()))?;
            }
            let script = format!(
                r#"(() => {{
                    const el = document.activeElement || document.body;
                    const key = {key};
                    el.dispatchEvent(new KeyboardEvent('keydown', {{key, bubbles: true}}));
                    el.dispatchEvent(new KeyboardEvent('keyup', {{key, bubbles: true}}));
                }})()"#,
                key = js_string(key)
            );
            page.evaluate(script)
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
        ScriptedAction::WaitForNavigation => {
            page.wait_for_navigation()
                .await
                .map_err(|e| fail(e.to_string()))?;
        }
    }

    Ok(())
}

// JSON escaping doubles as JS string escaping for selector/value interpolation
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(action_type: &str, selector: Option<&str>, value: Option<&str>) -> ActionSpec {
        ActionSpec {
            action_type: action_type.to_string(),
            selector: selector.map(|s| s.to_string()),
            value: value.map(|s| s.to_string()),
            delay: None,
            wait_time: None,
        }
    }

    #[test]
    fn test_unknown_action_is_skipped_not_fatal() {
        let specs = vec![
            action("click", Some("#a"), None),
            action("teleport", Some("#b"), None),
            action("scrollToBottom", None, None),
            action("type", Some("#c"), Some("hello")),
        ];

        let compiled = compile_actions(&specs);
        assert_eq!(compiled.len(), 3);
        assert_eq!(compiled[0].kind(), "click");
        assert_eq!(compiled[1].kind(), "scrollToBottom");
        assert_eq!(compiled[2].kind(), "type");
    }

    #[test]
    fn test_actions_keep_order() {
        let specs = vec![
            action("wait", Some("#list"), None),
            action("click", Some("#more"), None),
            action("scroll", None, None),
        ];
        let compiled = compile_actions(&specs);
        let kinds: Vec<_> = compiled.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, vec!["wait", "click", "scroll"]);
    }

    #[test]
    fn test_missing_required_fields_skipped() {
        // type without a value cannot be executed
        let specs = vec![action("type", Some("#a"), None), action("click", None, None)];
        assert!(compile_actions(&specs).is_empty());
    }

    #[test]
    fn test_wire_format_round_trip() {
        let spec: ActionSpec = serde_json::from_value(json!({
            "type": "waitAndClick",
            "selector": "#submit",
            "waitTime": 2500
        }))
        .unwrap();
        assert_eq!(spec.action_type, "waitAndClick");
        assert_eq!(spec.wait_time, Some(2500));

        match compile_action(&spec).unwrap() {
            ScriptedAction::WaitAndClick {
                selector,
                timeout_ms,
            } => {
                assert_eq!(selector, "#submit");
                assert_eq!(timeout_ms, 2500);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_type_human_default_delay() {
        let spec = action("typeHuman", Some("#q"), Some("rust"));
        match compile_action(&spec).unwrap() {
            ScriptedAction::TypeHuman { delay_ms, .. } => assert_eq!(delay_ms, HUMAN_TYPE_DELAY_MS),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(js_string("a\"b"), "\"a\\\"b\"");
    }
}
