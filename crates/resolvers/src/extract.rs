//! Narrow extraction helpers for the brittle, upstream-coupled patterns.
//!
//! Everything page-scraping lives here so a markup change upstream is a
//! one-file fix. Patterns are intentionally literal copies of what the
//! upstream pages actually serve today.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static MANIFEST_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+?\.m3u8[^\s"'<>]*"#).unwrap());
static LEGACY_VAR_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"var url = "([^"]+)""#).unwrap());
static IFRAME_SRC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<iframe[^>]+src=["']([^"']+)["']"#).unwrap());
static IFRAME_JS_SRC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)ifr\.src\s*=\s*["']([^"']+)["']"#).unwrap());
static PARAM_IN_API_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)api/v/\?[^\s\x22'<>]*?z=([a-f0-9]{32})").unwrap());
static PARAM_IN_SCRIPT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bz\b["']?\s*[:=]\s*["']([a-f0-9]{32})["']"#).unwrap());
static BARE_HEX32_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([a-f0-9]{32})\b").unwrap());
static CONFIG_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""url"\s*:\s*"([^"]+)""#).unwrap());
static CONFIG_UID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""uid"\s*:\s*"([^"]+)""#).unwrap());

#[inline]
pub fn capture_group_1<'a>(re: &Regex, input: &'a str) -> Option<&'a str> {
    re.captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[inline]
pub fn capture_group_1_owned(re: &Regex, input: &str) -> Option<String> {
    capture_group_1(re, input).map(ToOwned::to_owned)
}

/// First absolute manifest URL embedded in arbitrary response text.
///
/// The legacy `var url = "..."` form takes precedence because the paid-key
/// endpoint still serves it for some credentials.
pub fn manifest_url(text: &str) -> Option<String> {
    if let Some(url) = capture_group_1(&LEGACY_VAR_URL_REGEX, text)
        && url.starts_with("http")
    {
        return Some(url.to_owned());
    }
    MANIFEST_URL_REGEX
        .find(text)
        .map(|m| m.as_str().to_owned())
}

/// The `src` of the first iframe on a gateway page, absolutized against the
/// page URL when relative. Falls back to the `ifr.src = "..."` script form.
pub fn iframe_url(html: &str, page_url: &str) -> Option<String> {
    let raw = capture_group_1(&IFRAME_SRC_REGEX, html)
        .or_else(|| capture_group_1(&IFRAME_JS_SRC_REGEX, html))?;

    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_owned());
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    url::Url::parse(page_url)
        .and_then(|base| base.join(raw))
        .map(|u| u.to_string())
        .ok()
}

/// The 32-hex shared parameter scraped out of a gateway or player page.
///
/// Three tiers, most to least specific: the parameter inside an API call
/// URL, a script-level assignment, and finally any bare 32-hex token whose
/// surrounding text mentions the API path.
pub fn shared_param(html: &str) -> Option<String> {
    if let Some(v) = capture_group_1_owned(&PARAM_IN_API_URL_REGEX, html) {
        return Some(v.to_lowercase());
    }
    if let Some(v) = capture_group_1_owned(&PARAM_IN_SCRIPT_REGEX, html) {
        return Some(v.to_lowercase());
    }
    for caps in BARE_HEX32_REGEX.captures_iter(html) {
        let m = caps.get(1)?;
        let start = m.start().saturating_sub(100);
        let end = (m.end() + 100).min(html.len());
        let context = &html[start..end];
        if context.contains("api/v") || context.contains("z=") {
            return Some(m.as_str().to_lowercase());
        }
    }
    None
}

/// The embedded player config: (base64 encrypted URL, session uid).
///
/// The page escapes slashes inside JSON strings; they are unescaped here so
/// the blob base64-decodes cleanly.
pub fn player_config(html: &str) -> Option<(String, String)> {
    let url = capture_group_1(&CONFIG_URL_REGEX, html)?.replace("\\/", "/");
    let uid = capture_group_1_owned(&CONFIG_UID_REGEX, html)?;
    Some((url, uid))
}

/// Depth-first search for an absolute manifest URL anywhere in a JSON value.
pub fn manifest_in_json(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.starts_with("http") && s.contains(".m3u8") => Some(s.clone()),
        Value::Object(map) => map.values().find_map(manifest_in_json),
        Value::Array(items) => items.iter().find_map(manifest_in_json),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn manifest_url_prefers_legacy_var_form() {
        let body = r#"<script>var url = "https://cdn.example.com/a/index.m3u8";</script>
                      https://other.example.com/b/index.m3u8"#;
        assert_eq!(
            manifest_url(body).as_deref(),
            Some("https://cdn.example.com/a/index.m3u8")
        );
    }

    #[test]
    fn manifest_url_falls_back_to_any_embedded_link() {
        let body = r#"{"data":{"url":"https://cdn.example.com/v/index.m3u8?sign=abc"}}"#;
        assert_eq!(
            manifest_url(body).as_deref(),
            Some("https://cdn.example.com/v/index.m3u8?sign=abc")
        );
        assert_eq!(manifest_url("no links here"), None);
    }

    #[rstest]
    #[case(
        r#"<iframe width="100%" src="https://player.example.com/p?u=1"></iframe>"#,
        Some("https://player.example.com/p?u=1")
    )]
    #[case(
        r#"<iframe src="//player.example.com/p"></iframe>"#,
        Some("https://player.example.com/p")
    )]
    #[case(
        r#"<script>var ifr = document.createElement("iframe"); ifr.src="/inner/play.html";</script>"#,
        Some("https://gateway.example.com/inner/play.html")
    )]
    #[case("<p>no frame</p>", None)]
    fn iframe_url_variants(#[case] html: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            iframe_url(html, "https://gateway.example.com/page.html").as_deref(),
            expected
        );
    }

    #[test]
    fn shared_param_from_api_call_url() {
        let html = r#"fetch("https://api.example.com/api/v/?z=0123456789abcdef0123456789abcdef&jx=x")"#;
        assert_eq!(
            shared_param(html).as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn shared_param_from_script_assignment() {
        let html = r#"<script>var z = "ABCDEF0123456789abcdef0123456789";</script>"#;
        assert_eq!(
            shared_param(html).as_deref(),
            Some("abcdef0123456789abcdef0123456789")
        );
    }

    #[test]
    fn shared_param_requires_api_context_for_bare_hex() {
        // A random 32-hex token (say a build hash) must not be picked up.
        let unrelated = "asset-0123456789abcdef0123456789abcdef.css is our stylesheet";
        assert_eq!(shared_param(unrelated), None);

        let nearby = "call api/v endpoint with 0123456789abcdef0123456789abcdef now";
        assert_eq!(
            shared_param(nearby).as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn player_config_unescapes_slashes() {
        let html = r#"var ConFig = {"url":"aGVsbG8\/d29ybGQ=","config":{"uid":"123456"}};"#;
        let (url, uid) = player_config(html).unwrap();
        assert_eq!(url, "aGVsbG8/d29ybGQ=");
        assert_eq!(uid, "123456");
    }

    #[test]
    fn manifest_in_json_searches_nested_structures() {
        let v: Value = serde_json::from_str(
            r#"{"code":200,"data":{"list":[{"name":"ep1","play":"https://c.example.com/x.m3u8"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            manifest_in_json(&v).as_deref(),
            Some("https://c.example.com/x.m3u8")
        );

        let none: Value = serde_json::from_str(r#"{"data":["plain", 42]}"#).unwrap();
        assert_eq!(manifest_in_json(&none), None);
    }
}
