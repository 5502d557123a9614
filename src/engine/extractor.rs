use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use url::Url;

/// 字段提取规则
///
/// 将一个命名输出字段映射到选择器、提取策略和可选的转换。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorSpec {
    /// 字段名称，在任务的提取器列表中唯一
    pub name: String,
    /// 提取类型
    #[serde(rename = "type")]
    pub extract_type: String,
    /// CSS选择器
    #[serde(default)]
    pub selector: Option<String>,
    /// 属性名（type=attribute时必填）
    #[serde(default)]
    pub attribute: Option<String>,
    /// 是否提取多个元素
    #[serde(default)]
    pub multiple: bool,
    /// 可选的值转换
    #[serde(default)]
    pub transform: Option<String>,
}

/// 提取类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractKind {
    Text,
    Html,
    Attribute,
    Href,
    Src,
    Count,
    Exists,
}

impl ExtractKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ExtractKind::Text),
            "html" => Some(ExtractKind::Html),
            "attribute" => Some(ExtractKind::Attribute),
            "href" => Some(ExtractKind::Href),
            "src" => Some(ExtractKind::Src),
            "count" => Some(ExtractKind::Count),
            "exists" => Some(ExtractKind::Exists),
            _ => None,
        }
    }
}

/// 值转换枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transform {
    Lowercase,
    Uppercase,
    Trim,
    Number,
}

impl Transform {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "lowercase" => Some(Transform::Lowercase),
            "uppercase" => Some(Transform::Uppercase),
            "trim" => Some(Transform::Trim),
            "number" => Some(Transform::Number),
            _ => None,
        }
    }
}

/// 默认提取时按优先级探测的正文容器选择器
static CONTENT_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        "article",
        "main",
        "[role=\"main\"]",
        "#content",
        ".content",
        "#main",
        ".post",
        ".article-body",
    ]
    .iter()
    .filter_map(|s| Selector::parse(s).ok())
    .collect()
});

const MAX_CONTENT_CHARS: usize = 5000;
const MAX_LINKS: usize = 100;
const MAX_IMAGES: usize = 50;

/// 对HTML内容运行一组命名提取器
///
/// 每个字段独立提取：单个提取器失败只会让它自己的字段
/// 变为null（multiple时为空数组），从不中断其他字段。
///
/// # 参数
///
/// * `html` - 会话渲染后的页面内容
/// * `specs` - 提取规则列表
///
/// # 返回值
///
/// 提取器名称到提取值的映射
pub fn extract_fields(html: &str, specs: &[ExtractorSpec]) -> Map<String, Value> {
    let document = Html::parse_document(html);
    let mut result = Map::new();

    for spec in specs {
        let value = extract_field(&document, spec);
        result.insert(spec.name.clone(), value);
    }

    result
}

fn empty_value(multiple: bool) -> Value {
    if multiple {
        Value::Array(Vec::new())
    } else {
        Value::Null
    }
}

fn extract_field(document: &Html, spec: &ExtractorSpec) -> Value {
    let kind = match ExtractKind::parse(&spec.extract_type) {
        Some(k) => k,
        None => {
            warn!(
                "Unknown extractor type '{}' for field '{}', yielding null",
                spec.extract_type, spec.name
            );
            return empty_value(spec.multiple);
        }
    };

    let selector_str = match &spec.selector {
        Some(s) => s,
        None => {
            warn!("Extractor '{}' has no selector, yielding null", spec.name);
            return empty_value(spec.multiple);
        }
    };

    let selector = match Selector::parse(selector_str) {
        Ok(s) => s,
        Err(_) => {
            warn!(
                "Invalid selector '{}' for field '{}', yielding null",
                selector_str, spec.name
            );
            return empty_value(spec.multiple);
        }
    };

    let raw = match kind {
        ExtractKind::Count => Value::from(document.select(&selector).count() as u64),
        ExtractKind::Exists => Value::Bool(document.select(&selector).next().is_some()),
        ExtractKind::Text | ExtractKind::Html | ExtractKind::Attribute | ExtractKind::Href
        | ExtractKind::Src => {
            let attr = match kind {
                ExtractKind::Attribute => match &spec.attribute {
                    Some(a) => Some(a.as_str()),
                    None => {
                        warn!(
                            "Extractor '{}' is type=attribute but names no attribute",
                            spec.name
                        );
                        return empty_value(spec.multiple);
                    }
                },
                ExtractKind::Href => Some("href"),
                ExtractKind::Src => Some("src"),
                _ => None,
            };

            if spec.multiple {
                let mut values: Vec<Value> = document
                    .select(&selector)
                    .filter_map(|el| element_value(el, kind, attr))
                    .map(Value::String)
                    .collect();
                // collection href/src extraction only keeps absolute http(s) URLs
                if matches!(kind, ExtractKind::Href | ExtractKind::Src) {
                    values.retain(|v| v.as_str().map(is_absolute_http).unwrap_or(false));
                }
                Value::Array(values)
            } else {
                document
                    .select(&selector)
                    .next()
                    .and_then(|el| element_value(el, kind, attr))
                    .map(Value::String)
                    .unwrap_or(Value::Null)
            }
        }
    };

    apply_transform(raw, spec.transform.as_deref(), &spec.name)
}

fn element_value(el: ElementRef, kind: ExtractKind, attr: Option<&str>) -> Option<String> {
    match kind {
        ExtractKind::Text => {
            let text = el.text().collect::<Vec<_>>().join(" ").trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        ExtractKind::Html => Some(el.html()),
        _ => attr.and_then(|a| el.value().attr(a)).map(|s| s.to_string()),
    }
}

fn is_absolute_http(s: &str) -> bool {
    Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn apply_transform(value: Value, transform: Option<&str>, field: &str) -> Value {
    let transform = match transform {
        Some(t) if !t.is_empty() && t != "none" => t,
        _ => return value,
    };

    let transform = match Transform::parse(transform) {
        Some(t) => t,
        None => {
            warn!("Unknown transform '{}' for field '{}', skipped", transform, field);
            return value;
        }
    };

    // applied uniformly whether the result is scalar or a collection
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| transform_scalar(v, transform))
                .collect(),
        ),
        other => transform_scalar(other, transform),
    }
}

fn transform_scalar(value: Value, transform: Transform) -> Value {
    match (&value, transform) {
        (Value::String(s), Transform::Lowercase) => Value::String(s.to_lowercase()),
        (Value::String(s), Transform::Uppercase) => Value::String(s.to_uppercase()),
        (Value::String(s), Transform::Trim) => Value::String(s.trim().to_string()),
        (Value::String(s), Transform::Number) => parse_number(s),
        // numbers and booleans pass through unchanged
        _ => value,
    }
}

fn parse_number(s: &str) -> Value {
    match s.trim().parse::<f64>() {
        Ok(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::from(n as i64),
        Ok(n) => Value::from(n),
        // parse failure falls back to zero
        Err(_) => Value::from(0),
    }
}

/// 默认提取
///
/// 没有配置提取器时的回退：标题、URL、按固定优先级探测的
/// 正文文本、链接和图片，全部有数量上限。
pub fn default_extract(html: &str, page_url: &str) -> Map<String, Value> {
    let document = Html::parse_document(html);
    let mut result = Map::new();

    let title_selector = Selector::parse("title").expect("static selector");
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
        .filter(|t| !t.is_empty());
    result.insert(
        "title".to_string(),
        title.map(Value::String).unwrap_or(Value::Null),
    );
    result.insert("url".to_string(), Value::String(page_url.to_string()));

    // probe common content containers in priority order, body as last resort
    let mut content: Option<String> = None;
    for selector in CONTENT_SELECTORS.iter() {
        if let Some(el) = document.select(selector).next() {
            let text = normalize_text(el);
            if !text.is_empty() {
                content = Some(text);
                break;
            }
        }
    }
    if content.is_none() {
        let body_selector = Selector::parse("body").expect("static selector");
        content = document
            .select(&body_selector)
            .next()
            .map(normalize_text)
            .filter(|t| !t.is_empty());
    }
    let content = content.map(|t| {
        if t.chars().count() > MAX_CONTENT_CHARS {
            t.chars().take(MAX_CONTENT_CHARS).collect()
        } else {
            t
        }
    });
    result.insert(
        "content".to_string(),
        content.map(Value::String).unwrap_or(Value::Null),
    );

    let link_selector = Selector::parse("a[href]").expect("static selector");
    let links: Vec<Value> = document
        .select(&link_selector)
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| is_absolute_http(href))
        .take(MAX_LINKS)
        .map(|href| Value::String(href.to_string()))
        .collect();
    result.insert("links".to_string(), Value::Array(links));

    let image_selector = Selector::parse("img[src]").expect("static selector");
    let images: Vec<Value> = document
        .select(&image_selector)
        .filter_map(|el| el.value().attr("src"))
        .filter(|src| is_absolute_http(src))
        .take(MAX_IMAGES)
        .map(|src| Value::String(src.to_string()))
        .collect();
    result.insert("images".to_string(), Value::Array(images));

    result
}

fn normalize_text(el: ElementRef) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, extract_type: &str, selector: &str) -> ExtractorSpec {
        ExtractorSpec {
            name: name.to_string(),
            extract_type: extract_type.to_string(),
            selector: Some(selector.to_string()),
            attribute: None,
            multiple: false,
            transform: None,
        }
    }

    const PAGE: &str = r#"
        <html>
            <head><title>Test Page</title></head>
            <body>
                <h1>Welcome</h1>
                <div class="price"> 42 </div>
                <span class="junk">42abc</span>
                <a href="https://a.com">A</a>
                <a href="/relative">R</a>
                <a href="https://b.com">B</a>
                <ul><li>one</li><li>two</li><li>three</li></ul>
            </body>
        </html>
    "#;

    #[test]
    fn test_text_extraction() {
        let result = extract_fields(PAGE, &[spec("title", "text", "h1")]);
        assert_eq!(result["title"], json!("Welcome"));
    }

    #[test]
    fn test_failed_extractor_is_isolated() {
        let specs = vec![
            spec("first", "text", "h1"),
            spec("second", "text", "#does-not-exist"),
            spec("third", "count", "li"),
        ];
        let result = extract_fields(PAGE, &specs);

        assert_eq!(result["first"], json!("Welcome"));
        assert_eq!(result["second"], Value::Null);
        assert_eq!(result["third"], json!(3));
    }

    #[test]
    fn test_unknown_type_yields_null() {
        let result = extract_fields(PAGE, &[spec("field", "regex", "h1")]);
        assert_eq!(result["field"], Value::Null);
    }

    #[test]
    fn test_multiple_href_filters_relative_links() {
        let mut href_spec = spec("links", "href", "a");
        href_spec.multiple = true;
        let result = extract_fields(PAGE, &[href_spec]);

        assert_eq!(result["links"], json!(["https://a.com", "https://b.com"]));
    }

    #[test]
    fn test_exists_and_count() {
        let result = extract_fields(
            PAGE,
            &[spec("has_h1", "exists", "h1"), spec("items", "count", "li")],
        );
        assert_eq!(result["has_h1"], json!(true));
        assert_eq!(result["items"], json!(3));
    }

    #[test]
    fn test_number_transform_with_fallback() {
        let mut ok = spec("price", "text", ".price");
        ok.transform = Some("number".to_string());
        let mut bad = spec("junk", "text", ".junk");
        bad.transform = Some("number".to_string());

        let result = extract_fields(PAGE, &[ok, bad]);
        assert_eq!(result["price"], json!(42));
        assert_eq!(result["junk"], json!(0));
    }

    #[test]
    fn test_transform_applies_to_collections() {
        let mut items = spec("items", "text", "li");
        items.multiple = true;
        items.transform = Some("uppercase".to_string());

        let result = extract_fields(PAGE, &[items]);
        assert_eq!(result["items"], json!(["ONE", "TWO", "THREE"]));
    }

    #[test]
    fn test_attribute_requires_attribute_name() {
        let result = extract_fields(PAGE, &[spec("attr", "attribute", "a")]);
        assert_eq!(result["attr"], Value::Null);
    }

    #[test]
    fn test_default_extract() {
        let html = r##"
            <html>
                <head><title>Front Page</title></head>
                <body>
                    <article>Main   story text</article>
                    <a href="https://x.com/a">x</a>
                    <a href="#anchor">anchor</a>
                    <img src="https://cdn.x.com/1.png">
                </body>
            </html>
        "##;
        let result = default_extract(html, "https://x.com");

        assert_eq!(result["title"], json!("Front Page"));
        assert_eq!(result["url"], json!("https://x.com"));
        assert_eq!(result["content"], json!("Main story text"));
        assert_eq!(result["links"], json!(["https://x.com/a"]));
        assert_eq!(result["images"], json!(["https://cdn.x.com/1.png"]));
    }
}
