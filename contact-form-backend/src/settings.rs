//! Environment-sourced configuration, read once at startup.

use crate::origin::AllowedOrigins;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SPAM_LOG_DIR: &str = "/var/log/contact-form";
const DEFAULT_MAX_SIZE_MB: u64 = 10;
const DEFAULT_RETENTION_DAYS: u64 = 10;
const BYTES_PER_MB: u64 = 1024 * 1024;
const SECS_PER_DAY: u64 = 24 * 60 * 60;
pub const MIN_TOKEN_SECRET_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOKEN_SECRET must be at least 16 bytes")]
    TokenSecretTooShort,
    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub allowed_origins: AllowedOrigins,
    /// Externally supplied token secret. When absent a fresh one is generated per process.
    pub token_secret: Option<String>,
    pub mail: MailSettings,
    pub spam_log: SpamLogSettings,
    pub report: ReportSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_var("PORT")?.unwrap_or(DEFAULT_PORT),
            allowed_origins: AllowedOrigins::parse(&var("CORS_ALLOW_ORIGINS").unwrap_or_default()),
            token_secret: var("TOKEN_SECRET"),
            mail: MailSettings::from_env()?,
            spam_log: SpamLogSettings::from_env(),
            report: ReportSettings::from_env(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpTls {
    /// TLS from the first byte, usually port 465.
    Implicit,
    StartTls,
    /// Plaintext. Credentials are never sent over such a connection.
    None,
}

impl SmtpTls {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tls" | "smtps" => Ok(SmtpTls::Implicit),
            "starttls" => Ok(SmtpTls::StartTls),
            "none" | "plain" => Ok(SmtpTls::None),
            _ => Err(ConfigError::InvalidValue {
                name: "SMTP_TLS",
                value: value.into(),
            }),
        }
    }

    fn default_for_port(port: Option<u16>) -> Self {
        match port {
            Some(465) => SmtpTls::Implicit,
            _ => SmtpTls::StartTls,
        }
    }
}

/// Mail endpoint settings. Every field may be absent at startup; completeness is only
/// checked when a message is actually sent.
#[derive(Clone)]
pub struct MailSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: SmtpTls,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub report_recipient: Option<String>,
}

impl MailSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("SMTP_PORT")?;
        let tls = match var("SMTP_TLS") {
            Some(value) => SmtpTls::parse(&value)?,
            None => SmtpTls::default_for_port(port),
        };
        Ok(Self {
            host: var("SMTP_HOST"),
            port,
            username: var("SMTP_USERNAME"),
            password: var("SMTP_PASSWORD"),
            tls,
            sender: var("SENDER_EMAIL"),
            recipient: var("RECIPIENT_EMAIL"),
            report_recipient: var("SPAM_REPORT_RECIPIENT"),
        })
    }

    pub(crate) fn complete(&self) -> Result<CompleteMailSettings<'_>, ConfigError> {
        let mut missing = Vec::new();
        if self.host.is_none() {
            missing.push("SMTP_HOST");
        }
        if self.port.is_none() {
            missing.push("SMTP_PORT");
        }
        if self.username.is_none() {
            missing.push("SMTP_USERNAME");
        }
        if self.password.is_none() {
            missing.push("SMTP_PASSWORD");
        }
        if self.sender.is_none() {
            missing.push("SENDER_EMAIL");
        }
        if self.recipient.is_none() {
            missing.push("RECIPIENT_EMAIL");
        }
        match self {
            MailSettings {
                host: Some(host),
                port: Some(port),
                username: Some(username),
                password: Some(password),
                tls,
                sender: Some(sender),
                recipient: Some(recipient),
                report_recipient,
            } => Ok(CompleteMailSettings {
                host,
                port: *port,
                username,
                password,
                tls: *tls,
                sender,
                recipient,
                report_recipient: report_recipient.as_deref().unwrap_or(recipient),
            }),
            _ => Err(ConfigError::Missing(missing)),
        }
    }
}

impl std::fmt::Debug for MailSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .field("sender", &self.sender)
            .field("recipient", &self.recipient)
            .field("report_recipient", &self.report_recipient)
            .finish()
    }
}

pub(crate) struct CompleteMailSettings<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: &'a str,
    pub tls: SmtpTls,
    pub sender: &'a str,
    pub recipient: &'a str,
    pub report_recipient: &'a str,
}

#[derive(Debug, Clone)]
pub struct SpamLogSettings {
    pub dir: PathBuf,
    pub max_file_size: u64,
    pub retention: Duration,
}

impl SpamLogSettings {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dir: var("SPAM_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.dir),
            max_file_size: positive_var("SPAM_LOG_MAX_SIZE_MB")
                .and_then(|megabytes| megabytes.checked_mul(BYTES_PER_MB))
                .unwrap_or(defaults.max_file_size),
            retention: positive_var("SPAM_LOG_RETENTION_DAYS")
                .and_then(|days| days.checked_mul(SECS_PER_DAY))
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
        }
    }
}

impl Default for SpamLogSettings {
    fn default() -> Self {
        Self {
            dir: DEFAULT_SPAM_LOG_DIR.into(),
            max_file_size: DEFAULT_MAX_SIZE_MB * BYTES_PER_MB,
            retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * SECS_PER_DAY),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportSettings {
    pub enabled: bool,
}

impl ReportSettings {
    fn from_env() -> Self {
        Self {
            enabled: var("SPAM_REPORT_ENABLED").as_deref() == Some("true"),
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    var(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value })
        })
        .transpose()
}

// Non-positive or garbled values fall back to the default rather than failing startup. So do
// values which overflow once scaled, see `SpamLogSettings::from_env`.
fn positive_var(name: &str) -> Option<u64> {
    var(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}
