//! Webhook rules and dispatcher
//!
//! Rules carry URL/body/header templates with a `{bpm}` placeholder and a
//! set of triggers. The dispatcher fires each matching rule in its own task;
//! one rule's failure never affects another rule or the connection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::hub::Trigger;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BODY: &str = "{\n  \"bpm\": \"{bpm}\"\n}";
const DEFAULT_HEADERS: &str = "{\n  \"Content-Type\": \"application/json\"\n}";
const DEFAULT_USER_AGENT: &str = "heartlink-webhook";

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook persistence error: {0}")]
    Persistence(String),

    #[error("Headers are not a valid JSON object: {0}")]
    InvalidHeaders(String),

    #[error("Request failed: {0}")]
    Request(String),
}

/// One configured outbound webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRule {
    pub name: String,
    pub url: String,
    pub enabled: bool,
    /// Request body template; `{bpm}` is substituted at dispatch time.
    pub body: String,
    /// Header map template as JSON object text; `{bpm}` substituted too.
    pub headers: String,
    pub triggers: Vec<Trigger>,
}

impl WebhookRule {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled: true,
            body: DEFAULT_BODY.to_string(),
            headers: DEFAULT_HEADERS.to_string(),
            triggers: vec![Trigger::HeartRateUpdated],
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "url": self.url,
            "enabled": self.enabled,
            "body": self.body,
            "headers": self.headers,
            "triggers": self.triggers,
        })
    }

    /// Parse a rule from its JSON form. Tolerant by design: trigger names
    /// match case-insensitively, a legacy single `trigger` field is
    /// accepted, unknown names are dropped with a warning, and an empty
    /// trigger set is coerced to `{heart_rate_updated}`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let url = value.get("url")?.as_str()?.to_string();
        let enabled = value.get("enabled").and_then(Value::as_bool).unwrap_or(true);
        let body = value
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_BODY)
            .to_string();
        let headers = value
            .get("headers")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_HEADERS)
            .to_string();

        let mut triggers = Vec::new();
        if let Some(list) = value.get("triggers").and_then(Value::as_array) {
            for entry in list {
                if let Some(name) = entry.as_str() {
                    match parse_trigger(name) {
                        Some(trigger) if !triggers.contains(&trigger) => triggers.push(trigger),
                        Some(_) => {}
                        None => log::warn!("Ignoring unknown webhook trigger: {}", name),
                    }
                }
            }
        } else if let Some(legacy) = value.get("trigger").and_then(Value::as_str) {
            match parse_trigger(legacy) {
                Some(trigger) => triggers.push(trigger),
                None => log::warn!("Ignoring unknown legacy webhook trigger: {}", legacy),
            }
        }
        if triggers.is_empty() {
            triggers.push(Trigger::HeartRateUpdated);
        }

        Some(Self {
            name,
            url,
            enabled,
            body,
            headers,
            triggers,
        })
    }
}

fn parse_trigger(name: &str) -> Option<Trigger> {
    match name.to_ascii_lowercase().as_str() {
        "connected" => Some(Trigger::Connected),
        "disconnected" => Some(Trigger::Disconnected),
        "heart_rate_updated" => Some(Trigger::HeartRateUpdated),
        _ => None,
    }
}

/// File-backed rule list.
pub struct WebhookStore {
    path: Option<PathBuf>,
    rules: Mutex<Vec<WebhookRule>>,
}

impl WebhookStore {
    /// Load rules from `path`. A missing file means no rules; a malformed
    /// file is logged and treated as empty rather than failing startup.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let rules = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Array(entries)) => entries
                        .iter()
                        .filter_map(WebhookRule::from_json)
                        .collect(),
                    Ok(_) | Err(_) => {
                        log::error!("Webhook config {} is not a JSON array, ignoring", path.display());
                        Vec::new()
                    }
                },
                Err(e) => {
                    log::error!("Failed to read webhook config: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Self {
            path: Some(path),
            rules: Mutex::new(rules),
        }
    }

    /// An in-memory store that never touches disk.
    pub fn ephemeral(rules: Vec<WebhookRule>) -> Self {
        Self {
            path: None,
            rules: Mutex::new(rules),
        }
    }

    pub fn rules(&self) -> Vec<WebhookRule> {
        self.rules.lock().unwrap().clone()
    }

    pub fn set_rules(&self, rules: Vec<WebhookRule>) -> Result<(), WebhookError> {
        {
            let mut current = self.rules.lock().unwrap();
            *current = rules;
        }
        self.save()
    }

    fn save(&self) -> Result<(), WebhookError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let rules = self.rules.lock().unwrap();
        let entries: Vec<Value> = rules.iter().map(WebhookRule::to_json).collect();
        let text = serde_json::to_string_pretty(&Value::Array(entries))
            .map_err(|e| WebhookError::Persistence(e.to_string()))?;
        fs::write(path, text).map_err(|e| WebhookError::Persistence(e.to_string()))
    }
}

/// Fires matching rules on trigger events.
pub struct WebhookDispatcher {
    store: std::sync::Arc<WebhookStore>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(store: std::sync::Arc<WebhookStore>) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| WebhookError::Request(e.to_string()))?;
        Ok(Self { store, client })
    }

    /// Dispatch `trigger` to every enabled rule subscribed to it. Each rule
    /// runs in its own task; failures are logged per rule.
    pub fn fire(&self, trigger: Trigger, bpm: u16) {
        for rule in self.store.rules() {
            if !rule.enabled || !rule.triggers.contains(&trigger) {
                continue;
            }
            let client = self.client.clone();
            tokio::spawn(async move {
                match send_request(&client, &rule, trigger, bpm).await {
                    Ok(summary) => log::debug!("Webhook {} fired: {}", rule.name, summary),
                    Err(e) => log::error!("Webhook {} failed: {}", rule.name, e),
                }
            });
        }
    }

    /// One-shot dispatch of a single rule with a canned reading, returning a
    /// human-readable report. Used from the configuration surface.
    pub async fn test_rule(&self, rule: &WebhookRule) -> String {
        match send_request(&self.client, rule, Trigger::HeartRateUpdated, 88).await {
            Ok(summary) => format!("Webhook test ({}): {}", rule.name, summary),
            Err(e) => format!("Webhook test ({}) failed: {}", rule.name, e),
        }
    }
}

async fn send_request(
    client: &reqwest::Client,
    rule: &WebhookRule,
    trigger: Trigger,
    bpm: u16,
) -> Result<String, WebhookError> {
    // `{bpm}` is only meaningful for readings and the final value at
    // disconnect; a Connected firing sends the templates verbatim.
    let substitute = matches!(trigger, Trigger::HeartRateUpdated | Trigger::Disconnected);
    let bpm_text = bpm.to_string();
    let fill = |template: &str| {
        if substitute {
            template.replace("{bpm}", &bpm_text)
        } else {
            template.to_string()
        }
    };

    let url = fill(&rule.url);
    let body = fill(&rule.body);
    let headers: Map<String, Value> = serde_json::from_str(&fill(&rule.headers))
        .map_err(|e| WebhookError::InvalidHeaders(e.to_string()))?;

    let mut request = client.post(url.as_str()).body(body);
    let mut has_content_type = false;
    let mut has_user_agent = false;
    for (key, value) in &headers {
        let value = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        if key.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        if key.eq_ignore_ascii_case("user-agent") {
            has_user_agent = true;
        }
        request = request.header(key.as_str(), value);
    }
    if !has_content_type {
        request = request.header("Content-Type", "application/json");
    }
    if !has_user_agent {
        request = request.header("User-Agent", DEFAULT_USER_AGENT);
    }

    let response = request
        .send()
        .await
        .map_err(|e| WebhookError::Request(e.to_string()))?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Ok(format!("{} {}", status, snippet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let rule = WebhookRule::new("osd", "http://localhost:9000/hr");
        assert!(rule.enabled);
        assert_eq!(rule.triggers, vec![Trigger::HeartRateUpdated]);
        assert!(rule.body.contains("{bpm}"));
    }

    #[test]
    fn test_json_round_trip() {
        let mut rule = WebhookRule::new("osd", "http://localhost:9000/hr");
        rule.triggers = vec![Trigger::Connected, Trigger::HeartRateUpdated];
        let parsed = WebhookRule::from_json(&rule.to_json()).unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn test_trigger_names_case_insensitive() {
        let value = json!({
            "name": "osd",
            "url": "http://localhost:9000/hr",
            "enabled": true,
            "triggers": ["HEART_RATE_UPDATED", "Connected"],
        });
        let rule = WebhookRule::from_json(&value).unwrap();
        assert_eq!(rule.triggers, vec![Trigger::HeartRateUpdated, Trigger::Connected]);
    }

    #[test]
    fn test_legacy_single_trigger_field() {
        let value = json!({
            "name": "osd",
            "url": "http://localhost:9000/hr",
            "trigger": "disconnected",
        });
        let rule = WebhookRule::from_json(&value).unwrap();
        assert_eq!(rule.triggers, vec![Trigger::Disconnected]);
    }

    #[test]
    fn test_empty_triggers_coerced_to_heart_rate_updated() {
        let value = json!({
            "name": "osd",
            "url": "http://localhost:9000/hr",
            "triggers": [],
        });
        let rule = WebhookRule::from_json(&value).unwrap();
        assert_eq!(rule.triggers, vec![Trigger::HeartRateUpdated]);
    }

    #[test]
    fn test_unknown_triggers_dropped() {
        let value = json!({
            "name": "osd",
            "url": "http://localhost:9000/hr",
            "triggers": ["heart_rate_update", "connected"],
        });
        let rule = WebhookRule::from_json(&value).unwrap();
        assert_eq!(rule.triggers, vec![Trigger::Connected]);
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webhooks.json");

        let store = WebhookStore::load(&path);
        assert!(store.rules().is_empty());

        store
            .set_rules(vec![WebhookRule::new("osd", "http://localhost:9000/hr")])
            .unwrap();

        let reloaded = WebhookStore::load(&path);
        assert_eq!(reloaded.rules().len(), 1);
        assert_eq!(reloaded.rules()[0].name, "osd");
    }

    #[test]
    fn test_malformed_store_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webhooks.json");
        fs::write(&path, "{not json").unwrap();
        assert!(WebhookStore::load(&path).rules().is_empty());
    }
}
