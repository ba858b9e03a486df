//! 敏感字段脱敏
//!
//! 在写入主日志与镜像之前由 SessionManager 统一调用一次，调用方无需各自处理。
//! JSON 对象按键名（忽略大小写的子串匹配）整体替换值；自由文本按 `key=value`、`"key": "value"`、
//! `Bearer <token>` 三种形式替换。

use regex::Regex;
use serde_json::Value;

/// 脱敏后的固定掩码
pub const MASK: &str = "***REDACTED***";

/// 默认敏感键名
pub fn default_redact_keys() -> Vec<String> {
    [
        "password",
        "passwd",
        "secret",
        "token",
        "api_key",
        "apikey",
        "authorization",
        "credential",
        "private_key",
        "access_key",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
    quoted: Option<Regex>,
    bare: Option<Regex>,
    bearer: Option<Regex>,
}

impl Redactor {
    pub fn new(keys: &[String]) -> Self {
        let keys: Vec<String> = keys
            .iter()
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let (quoted, bare) = if keys.is_empty() {
            (None, None)
        } else {
            let alt = keys.iter().map(|k| regex::escape(k)).collect::<Vec<_>>().join("|");
            let quoted = Regex::new(&format!(
                r#"(?i)("[\w.-]*(?:{alt})[\w.-]*"\s*:\s*)"(?:[^"\\]|\\.)*""#
            ))
            .ok();
            let bare = Regex::new(&format!(r#"(?i)\b([\w.-]*(?:{alt})[\w.-]*\s*[=:]\s*)[^\s"',;&}}]+"#)).ok();
            (quoted, bare)
        };
        let bearer = Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*").ok();
        Self {
            keys,
            quoted,
            bare,
            bearer,
        }
    }

    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.keys.iter().any(|k| key.contains(k.as_str()))
    }

    /// 递归脱敏 JSON：敏感键的值整体替换，字符串值再做文本脱敏
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if self.is_sensitive_key(k) && !v.is_null() {
                            Value::String(MASK.to_string())
                        } else {
                            self.redact_value(v)
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::String(s) => Value::String(self.redact_text(s)),
            other => other.clone(),
        }
    }

    pub fn redact_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        if let Some(re) = &self.bearer {
            out = re.replace_all(&out, format!("Bearer {MASK}").as_str()).into_owned();
        }
        if let Some(re) = &self.quoted {
            out = re.replace_all(&out, format!("${{1}}\"{MASK}\"").as_str()).into_owned();
        }
        if let Some(re) = &self.bare {
            out = re.replace_all(&out, format!("${{1}}{MASK}").as_str()).into_owned();
        }
        out
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&default_redact_keys())
    }
}
