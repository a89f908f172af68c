//! Application configuration, loaded from a JSON file by the server binary.

use serde::{Deserialize, Serialize};

use crate::limits::ActionLimitsConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    pub webhook_secret: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default)]
    pub packs: Vec<PackConfig>,
    #[serde(default)]
    pub limits: ActionLimitsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grading: Option<GradingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments: Option<PaymentConfig>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sqlite_path() -> String {
    "lexam.sqlite".to_string()
}

impl AppConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn pack(&self, pack_id: &str) -> Option<&PackConfig> {
        self.packs.iter().find(|pack| pack.id == pack_id)
    }

    /// Resolves a bearer token to its key binding. Disabled keys do not
    /// resolve.
    pub fn api_key(&self, token: &str) -> Option<&ApiKeyConfig> {
        self.api_keys
            .iter()
            .find(|key| key.enabled && key.token == token)
    }
}

/// One bearer token and the account it acts as. Admin keys may also call the
/// `/v1/admin` surface.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: String,
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("admin", &self.admin)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl ApiKeyConfig {
    pub fn new(
        id: impl Into<String>,
        token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            user_id: user_id.into(),
            admin: false,
            enabled: true,
        }
    }

    pub fn with_admin(mut self) -> Self {
        self.admin = true;
        self
    }
}

/// A purchasable credit pack. The processor's webhook names the pack by id;
/// the credit quantity is always resolved from this table, never trusted from
/// the event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackConfig {
    pub id: String,
    pub credits: i64,
    pub price_usd_cents: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl std::fmt::Debug for GradingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradingConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl std::fmt::Debug for PaymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentConfig")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config = AppConfig::from_json_str(
            r#"{
              "webhook_secret": "whs_test",
              "api_keys": [
                {"id": "key-1", "token": "lx-user", "user_id": "u1"},
                {"id": "key-2", "token": "lx-admin", "user_id": "ops", "admin": true}
              ],
              "packs": [{"id": "pack5", "credits": 5, "price_usd_cents": 1999}]
            }"#,
        )
        .expect("parse");

        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.pack("pack5").map(|pack| pack.credits), Some(5));
        assert!(config.pack("pack99").is_none());
        assert!(config.api_key("lx-user").is_some());
        assert!(config.api_key("lx-admin").map(|key| key.admin).unwrap_or(false));
        assert!(config.api_key("nope").is_none());
    }

    #[test]
    fn disabled_keys_do_not_resolve() {
        let config = AppConfig::from_json_str(
            r#"{
              "webhook_secret": "whs_test",
              "api_keys": [
                {"id": "key-1", "token": "lx-user", "user_id": "u1", "enabled": false}
              ]
            }"#,
        )
        .expect("parse");
        assert!(config.api_key("lx-user").is_none());
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let key = ApiKeyConfig::new("key-1", "lx-secret-token", "u1");
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("lx-secret-token"));
        assert!(rendered.contains("<redacted>"));
    }
}
