use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono_tz::Tz;

use crate::notifications::EngineSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub bitrix: BitrixConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BitrixConfig {
    pub domain: String,
    pub webhook_token: String,
    /// Token the portal puts in `auth[application_token]` of outgoing webhooks.
    #[serde(default)]
    pub application_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Group chat that receives notifications.
    pub group_id: i64,
    /// Forum topic inside the group, if any.
    #[serde(default)]
    pub topic_id: Option<i32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// SQLite file. Empty selects the in-memory ledger, which forgets
    /// everything on restart.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "taskwatch.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_deadline_warning_hours")]
    pub deadline_warning_hours: i64,
    #[serde(default = "default_true")]
    pub enable_overdue_notifications: bool,
    #[serde(default = "default_true")]
    pub enable_deadline_warnings: bool,
    #[serde(default = "default_true")]
    pub enable_comment_notifications: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_terminal_statuses")]
    pub terminal_statuses: Vec<String>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            deadline_warning_hours: default_deadline_warning_hours(),
            enable_overdue_notifications: true,
            enable_deadline_warnings: true,
            enable_comment_notifications: true,
            timezone: default_timezone(),
            send_timeout_secs: default_send_timeout_secs(),
            terminal_statuses: default_terminal_statuses(),
        }
    }
}

fn default_schedule() -> String {
    "hourly".to_string()
}

fn default_deadline_warning_hours() -> i64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "Europe/Moscow".to_string()
}

fn default_send_timeout_secs() -> u64 {
    20
}

fn default_terminal_statuses() -> Vec<String> {
    vec!["5".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            webhook_path: default_webhook_path(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_webhook_path() -> String {
    "/bitrix/webhook".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IdentityConfig {
    /// Links upserted into the identity store at startup.
    #[serde(default)]
    pub links: Vec<LinkSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkSeed {
    pub telegram_id: i64,
    pub bitrix_user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Environment variables that override file values: `(variable, section, key)`.
const ENV_OVERRIDES: &[(&str, &str, &str)] = &[
    ("BITRIX24_DOMAIN", "bitrix", "domain"),
    ("BITRIX24_WEBHOOK_TOKEN", "bitrix", "webhook_token"),
    ("TELEGRAM_BOT_TOKEN", "telegram", "bot_token"),
    ("TELEGRAM_GROUP_ID", "telegram", "group_id"),
    ("DATABASE_PATH", "state", "db_path"),
];

fn apply_env_overrides(
    table: &mut toml::Table,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    for (var, section, key) in ENV_OVERRIDES {
        let Some(raw) = lookup(var) else {
            continue;
        };
        let value = if *key == "group_id" {
            let id: i64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer chat id", var))?;
            toml::Value::Integer(id)
        } else {
            toml::Value::String(raw)
        };
        let entry = table
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let toml::Value::Table(section_table) = entry {
            section_table.insert(key.to_string(), value);
        }
    }
    Ok(())
}

impl AppConfig {
    /// Load the TOML file (if present) and apply environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::load_with_env(path, |var| std::env::var(var).ok())
    }

    fn load_with_env(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut table: toml::Table = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else {
            toml::Table::new()
        };
        apply_env_overrides(&mut table, lookup)?;
        let config: AppConfig = toml::Value::Table(table)
            .try_into()
            .context("Incomplete configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bitrix.domain.trim().is_empty() {
            anyhow::bail!("bitrix.domain is required");
        }
        if self.bitrix.webhook_token.trim().is_empty() {
            anyhow::bail!("bitrix.webhook_token is required");
        }
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token is required");
        }
        if self.telegram.group_id == 0 {
            anyhow::bail!("telegram.group_id is required");
        }
        if !self.server.webhook_path.starts_with('/') {
            anyhow::bail!("server.webhook_path must start with '/'");
        }
        if self.notifications.deadline_warning_hours <= 0 {
            anyhow::bail!("notifications.deadline_warning_hours must be positive");
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        let name = self.notifications.timezone.trim();
        name.parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Unknown timezone '{}': {}", name, e))
    }

    pub fn engine_settings(&self) -> anyhow::Result<EngineSettings> {
        let n = &self.notifications;
        Ok(EngineSettings {
            chat_id: self.telegram.group_id,
            topic_id: self.telegram.topic_id,
            timezone: self.timezone()?,
            terminal_statuses: n.terminal_statuses.clone(),
            deadline_warning_hours: n.deadline_warning_hours,
            send_timeout: Duration::from_secs(n.send_timeout_secs.max(1)),
            enable_overdue_notifications: n.enable_overdue_notifications,
            enable_deadline_warnings: n.enable_deadline_warnings,
            enable_comment_notifications: n.enable_comment_notifications,
        })
    }

    /// Application token, treating an empty string as unset.
    pub fn application_token(&self) -> Option<String> {
        self.bitrix
            .application_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}
