use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compliance::{
    keywords::{DEFAULT_HELP_KEYWORDS, DEFAULT_START_KEYWORDS, DEFAULT_STOP_KEYWORDS},
    AckRenderer, AckTemplates, ComplianceEngine, KeywordDetector, QuietHours,
};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub conversation: ConversationConfig,
    pub retry: RetryConfig,
    pub compliance: ComplianceConfig,
    pub tenancy: TenancyConfig,
    pub voice: VoiceConfig,
    pub outbox: OutboxConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub webhook_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub webhook_secret: SecretString,
    pub messaging_profile_id: Option<String>,
    pub signature_max_skew_secs: u64,
    pub send_timeout_secs: u64,
    pub verify_signatures: bool,
}

#[derive(Clone, Debug)]
pub struct ConversationConfig {
    pub processor_url: Option<String>,
    pub processor_timeout_secs: u64,
    pub worker_count: usize,
    pub batch_size: usize,
    pub poll_wait_ms: u64,
    pub queue_capacity: usize,
    pub enqueue_timeout_secs: u64,
    pub voice_sync: bool,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    pub sweep_enabled: bool,
    pub sweep_interval_secs: u64,
    pub sweep_batch: u32,
}

#[derive(Clone, Debug)]
pub struct ComplianceConfig {
    pub stop_keywords: Vec<String>,
    pub help_keywords: Vec<String>,
    pub start_keywords: Vec<String>,
    pub acks: AckTemplates,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub quiet_hours_timezone: String,
}

#[derive(Clone, Debug, Default)]
pub struct TenancyConfig {
    /// Tenant used when an inbound number is not mapped to any clinic.
    pub demo_org_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct VoiceConfig {
    pub session_ttl_secs: u64,
}

/// Background relay that hands committed outbox rows to a sink.
#[derive(Clone, Debug)]
pub struct OutboxConfig {
    pub relay_enabled: bool,
    pub relay_interval_secs: u64,
    pub relay_batch: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub port: Option<u16>,
    pub webhook_secret: Option<String>,
    pub verify_signatures: Option<bool>,
    pub worker_count: Option<usize>,
    pub demo_org_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|word| (*word).to_string()).collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://ringback.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                webhook_timeout_secs: 10,
            },
            provider: ProviderConfig {
                api_key: String::new().into(),
                base_url: "https://api.telnyx.com/v2".to_string(),
                webhook_secret: String::new().into(),
                messaging_profile_id: None,
                signature_max_skew_secs: 300,
                send_timeout_secs: 3,
                verify_signatures: true,
            },
            conversation: ConversationConfig {
                processor_url: None,
                processor_timeout_secs: 8,
                worker_count: 2,
                batch_size: 5,
                poll_wait_ms: 2_000,
                queue_capacity: 128,
                enqueue_timeout_secs: 3,
                voice_sync: true,
            },
            retry: RetryConfig {
                base_delay_secs: 300,
                max_delay_secs: 86_400,
                max_attempts: 5,
                sweep_enabled: false,
                sweep_interval_secs: 60,
                sweep_batch: 25,
            },
            compliance: ComplianceConfig {
                stop_keywords: owned(DEFAULT_STOP_KEYWORDS),
                help_keywords: owned(DEFAULT_HELP_KEYWORDS),
                start_keywords: owned(DEFAULT_START_KEYWORDS),
                acks: AckTemplates::default(),
                quiet_hours_start: None,
                quiet_hours_end: None,
                quiet_hours_timezone: "UTC".to_string(),
            },
            tenancy: TenancyConfig::default(),
            voice: VoiceConfig { session_ttl_secs: 900 },
            outbox: OutboxConfig { relay_enabled: false, relay_interval_secs: 5, relay_batch: 100 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("ringback.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(webhook_timeout_secs) = server.webhook_timeout_secs {
                self.server.webhook_timeout_secs = webhook_timeout_secs;
            }
        }

        if let Some(provider) = patch.provider {
            if let Some(api_key) = provider.api_key {
                self.provider.api_key = secret_value(api_key);
            }
            if let Some(base_url) = provider.base_url {
                self.provider.base_url = base_url;
            }
            if let Some(webhook_secret) = provider.webhook_secret {
                self.provider.webhook_secret = secret_value(webhook_secret);
            }
            if let Some(messaging_profile_id) = provider.messaging_profile_id {
                self.provider.messaging_profile_id = Some(messaging_profile_id);
            }
            if let Some(skew) = provider.signature_max_skew_secs {
                self.provider.signature_max_skew_secs = skew;
            }
            if let Some(send_timeout_secs) = provider.send_timeout_secs {
                self.provider.send_timeout_secs = send_timeout_secs;
            }
            if let Some(verify_signatures) = provider.verify_signatures {
                self.provider.verify_signatures = verify_signatures;
            }
        }

        if let Some(conversation) = patch.conversation {
            if let Some(processor_url) = conversation.processor_url {
                self.conversation.processor_url = Some(processor_url);
            }
            if let Some(timeout) = conversation.processor_timeout_secs {
                self.conversation.processor_timeout_secs = timeout;
            }
            if let Some(worker_count) = conversation.worker_count {
                self.conversation.worker_count = worker_count;
            }
            if let Some(batch_size) = conversation.batch_size {
                self.conversation.batch_size = batch_size;
            }
            if let Some(poll_wait_ms) = conversation.poll_wait_ms {
                self.conversation.poll_wait_ms = poll_wait_ms;
            }
            if let Some(queue_capacity) = conversation.queue_capacity {
                self.conversation.queue_capacity = queue_capacity;
            }
            if let Some(enqueue_timeout_secs) = conversation.enqueue_timeout_secs {
                self.conversation.enqueue_timeout_secs = enqueue_timeout_secs;
            }
            if let Some(voice_sync) = conversation.voice_sync {
                self.conversation.voice_sync = voice_sync;
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(base_delay_secs) = retry.base_delay_secs {
                self.retry.base_delay_secs = base_delay_secs;
            }
            if let Some(max_delay_secs) = retry.max_delay_secs {
                self.retry.max_delay_secs = max_delay_secs;
            }
            if let Some(max_attempts) = retry.max_attempts {
                self.retry.max_attempts = max_attempts;
            }
            if let Some(sweep_enabled) = retry.sweep_enabled {
                self.retry.sweep_enabled = sweep_enabled;
            }
            if let Some(sweep_interval_secs) = retry.sweep_interval_secs {
                self.retry.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(sweep_batch) = retry.sweep_batch {
                self.retry.sweep_batch = sweep_batch;
            }
        }

        if let Some(compliance) = patch.compliance {
            if let Some(words) = compliance.stop_keywords {
                self.compliance.stop_keywords = words;
            }
            if let Some(words) = compliance.help_keywords {
                self.compliance.help_keywords = words;
            }
            if let Some(words) = compliance.start_keywords {
                self.compliance.start_keywords = words;
            }
            let acks = &mut self.compliance.acks;
            for (target, value) in [
                (&mut acks.stop, compliance.stop_ack),
                (&mut acks.help, compliance.help_ack),
                (&mut acks.start, compliance.start_ack),
                (&mut acks.sms, compliance.sms_ack),
                (&mut acks.missed_call, compliance.missed_call_ack),
                (&mut acks.card, compliance.card_ack),
            ] {
                if let Some(value) = value {
                    *target = value;
                }
            }
            if let Some(start) = compliance.quiet_hours_start {
                self.compliance.quiet_hours_start = Some(start);
            }
            if let Some(end) = compliance.quiet_hours_end {
                self.compliance.quiet_hours_end = Some(end);
            }
            if let Some(timezone) = compliance.quiet_hours_timezone {
                self.compliance.quiet_hours_timezone = timezone;
            }
        }

        if let Some(tenancy) = patch.tenancy {
            if let Some(demo_org_id) = tenancy.demo_org_id {
                self.tenancy.demo_org_id = Some(demo_org_id);
            }
        }

        if let Some(voice) = patch.voice {
            if let Some(session_ttl_secs) = voice.session_ttl_secs {
                self.voice.session_ttl_secs = session_ttl_secs;
            }
        }

        if let Some(outbox) = patch.outbox {
            if let Some(relay_enabled) = outbox.relay_enabled {
                self.outbox.relay_enabled = relay_enabled;
            }
            if let Some(relay_interval_secs) = outbox.relay_interval_secs {
                self.outbox.relay_interval_secs = relay_interval_secs;
            }
            if let Some(relay_batch) = outbox.relay_batch {
                self.outbox.relay_batch = relay_batch;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("RINGBACK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("RINGBACK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("RINGBACK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RINGBACK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("RINGBACK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RINGBACK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("RINGBACK_SERVER_PORT") {
            self.server.port = parse_u16("RINGBACK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("RINGBACK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("RINGBACK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("RINGBACK_PROVIDER_API_KEY") {
            self.provider.api_key = secret_value(value);
        }
        if let Some(value) = read_env("RINGBACK_PROVIDER_BASE_URL") {
            self.provider.base_url = value;
        }
        if let Some(value) = read_env("RINGBACK_PROVIDER_WEBHOOK_SECRET") {
            self.provider.webhook_secret = secret_value(value);
        }
        if let Some(value) = read_env("RINGBACK_PROVIDER_MESSAGING_PROFILE_ID") {
            self.provider.messaging_profile_id = Some(value);
        }
        if let Some(value) = read_env("RINGBACK_PROVIDER_VERIFY_SIGNATURES") {
            self.provider.verify_signatures =
                parse_bool("RINGBACK_PROVIDER_VERIFY_SIGNATURES", &value)?;
        }

        if let Some(value) = read_env("RINGBACK_CONVERSATION_PROCESSOR_URL") {
            self.conversation.processor_url = Some(value);
        }
        if let Some(value) = read_env("RINGBACK_CONVERSATION_WORKER_COUNT") {
            self.conversation.worker_count =
                parse_usize("RINGBACK_CONVERSATION_WORKER_COUNT", &value)?;
        }
        if let Some(value) = read_env("RINGBACK_CONVERSATION_VOICE_SYNC") {
            self.conversation.voice_sync = parse_bool("RINGBACK_CONVERSATION_VOICE_SYNC", &value)?;
        }

        if let Some(value) = read_env("RINGBACK_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_u32("RINGBACK_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("RINGBACK_RETRY_SWEEP_ENABLED") {
            self.retry.sweep_enabled = parse_bool("RINGBACK_RETRY_SWEEP_ENABLED", &value)?;
        }

        if let Some(value) = read_env("RINGBACK_OUTBOX_RELAY_ENABLED") {
            self.outbox.relay_enabled = parse_bool("RINGBACK_OUTBOX_RELAY_ENABLED", &value)?;
        }

        if let Some(value) = read_env("RINGBACK_TENANCY_DEMO_ORG_ID") {
            self.tenancy.demo_org_id = Some(value);
        }

        let log_level =
            read_env("RINGBACK_LOGGING_LEVEL").or_else(|| read_env("RINGBACK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RINGBACK_LOGGING_FORMAT").or_else(|| read_env("RINGBACK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(webhook_secret) = overrides.webhook_secret {
            self.provider.webhook_secret = secret_value(webhook_secret);
        }
        if let Some(verify_signatures) = overrides.verify_signatures {
            self.provider.verify_signatures = verify_signatures;
        }
        if let Some(worker_count) = overrides.worker_count {
            self.conversation.worker_count = worker_count;
        }
        if let Some(demo_org_id) = overrides.demo_org_id {
            self.tenancy.demo_org_id = Some(demo_org_id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_provider(&self.provider)?;
        validate_conversation(&self.conversation)?;
        validate_retry(&self.retry)?;
        validate_outbox(&self.outbox)?;
        self.compliance.build_engine()?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_secs: i64::try_from(self.base_delay_secs).unwrap_or(i64::MAX),
            max_delay_secs: i64::try_from(self.max_delay_secs).unwrap_or(i64::MAX),
            max_attempts: self.max_attempts,
        }
    }
}

impl ComplianceConfig {
    pub fn build_engine(&self) -> Result<ComplianceEngine, ConfigError> {
        let invalid = |err: crate::compliance::ComplianceBuildError| {
            ConfigError::Validation(format!("compliance: {err}"))
        };
        let detector =
            KeywordDetector::new(&self.stop_keywords, &self.help_keywords, &self.start_keywords)
                .map_err(invalid)?;
        let quiet_hours = match (&self.quiet_hours_start, &self.quiet_hours_end) {
            (Some(start), Some(end)) => {
                Some(QuietHours::new(start, end, &self.quiet_hours_timezone).map_err(invalid)?)
            }
            (None, None) => None,
            _ => {
                return Err(ConfigError::Validation(
                    "compliance.quiet_hours_start and quiet_hours_end must be set together"
                        .to_string(),
                ))
            }
        };
        let acks = AckRenderer::new(self.acks.clone()).map_err(invalid)?;
        Ok(ComplianceEngine::new(detector, quiet_hours, acks))
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("ringback.toml"), PathBuf::from("config/ringback.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if server.webhook_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "server.webhook_timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_provider(provider: &ProviderConfig) -> Result<(), ConfigError> {
    if provider.verify_signatures && provider.webhook_secret.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "provider.webhook_secret is required while provider.verify_signatures is true"
                .to_string(),
        ));
    }

    if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "provider.base_url must start with http:// or https://".to_string(),
        ));
    }

    if provider.send_timeout_secs == 0 || provider.send_timeout_secs > 30 {
        return Err(ConfigError::Validation(
            "provider.send_timeout_secs must be in range 1..=30".to_string(),
        ));
    }

    Ok(())
}

fn validate_conversation(conversation: &ConversationConfig) -> Result<(), ConfigError> {
    if conversation.worker_count == 0 {
        return Err(ConfigError::Validation(
            "conversation.worker_count must be greater than zero".to_string(),
        ));
    }
    if conversation.batch_size == 0 || conversation.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "conversation.batch_size and conversation.queue_capacity must be greater than zero"
                .to_string(),
        ));
    }
    if conversation.processor_timeout_secs == 0 || conversation.processor_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "conversation.processor_timeout_secs must be in range 1..=120".to_string(),
        ));
    }
    if let Some(url) = &conversation.processor_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "conversation.processor_url must start with http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_retry(retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "retry.max_attempts must be greater than zero".to_string(),
        ));
    }
    if retry.base_delay_secs == 0 || retry.base_delay_secs > retry.max_delay_secs {
        return Err(ConfigError::Validation(
            "retry.base_delay_secs must be in range 1..=retry.max_delay_secs".to_string(),
        ));
    }
    if retry.sweep_enabled && (retry.sweep_interval_secs == 0 || retry.sweep_batch == 0) {
        return Err(ConfigError::Validation(
            "retry.sweep_interval_secs and retry.sweep_batch must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_outbox(outbox: &OutboxConfig) -> Result<(), ConfigError> {
    if outbox.relay_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "outbox.relay_interval_secs must be greater than zero".to_string(),
        ));
    }
    if outbox.relay_batch == 0 {
        return Err(ConfigError::Validation("outbox.relay_batch must be greater than zero".to_string()));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    provider: Option<ProviderPatch>,
    conversation: Option<ConversationPatch>,
    retry: Option<RetryPatch>,
    compliance: Option<CompliancePatch>,
    tenancy: Option<TenancyPatch>,
    voice: Option<VoicePatch>,
    outbox: Option<OutboxPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    webhook_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    webhook_secret: Option<String>,
    messaging_profile_id: Option<String>,
    signature_max_skew_secs: Option<u64>,
    send_timeout_secs: Option<u64>,
    verify_signatures: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationPatch {
    processor_url: Option<String>,
    processor_timeout_secs: Option<u64>,
    worker_count: Option<usize>,
    batch_size: Option<usize>,
    poll_wait_ms: Option<u64>,
    queue_capacity: Option<usize>,
    enqueue_timeout_secs: Option<u64>,
    voice_sync: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryPatch {
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
    sweep_enabled: Option<bool>,
    sweep_interval_secs: Option<u64>,
    sweep_batch: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CompliancePatch {
    stop_keywords: Option<Vec<String>>,
    help_keywords: Option<Vec<String>>,
    start_keywords: Option<Vec<String>>,
    stop_ack: Option<String>,
    help_ack: Option<String>,
    start_ack: Option<String>,
    sms_ack: Option<String>,
    missed_call_ack: Option<String>,
    card_ack: Option<String>,
    quiet_hours_start: Option<String>,
    quiet_hours_end: Option<String>,
    quiet_hours_timezone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TenancyPatch {
    demo_org_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VoicePatch {
    session_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OutboxPatch {
    relay_enabled: Option<bool>,
    relay_interval_secs: Option<u64>,
    relay_batch: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_RINGBACK_WEBHOOK_SECRET", "whsec-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("ringback.toml");
            fs::write(
                &path,
                r#"
[provider]
webhook_secret = "${TEST_RINGBACK_WEBHOOK_SECRET}"

[compliance]
sms_ack = "One moment please."
quiet_hours_start = "21:00"
quiet_hours_end = "08:00"
quiet_hours_timezone = "America/Chicago"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.provider.webhook_secret.expose_secret() == "whsec-from-env",
                "webhook secret should be loaded from environment",
            )?;
            ensure(config.compliance.acks.sms == "One moment please.", "sms ack should be overridden")?;
            ensure(
                config.compliance.acks.stop.starts_with("You have been opted out"),
                "untouched acks keep their defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_RINGBACK_WEBHOOK_SECRET"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RINGBACK_PROVIDER_WEBHOOK_SECRET", "whsec-test");
        env::set_var("RINGBACK_LOG_LEVEL", "warn");
        env::set_var("RINGBACK_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "RINGBACK_PROVIDER_WEBHOOK_SECRET",
            "RINGBACK_LOG_LEVEL",
            "RINGBACK_LOG_FORMAT",
        ]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RINGBACK_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("RINGBACK_PROVIDER_WEBHOOK_SECRET", "whsec-from-env");
        env::set_var("RINGBACK_CONVERSATION_WORKER_COUNT", "6");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("ringback.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[provider]
webhook_secret = "whsec-from-file"

[conversation]
worker_count = 4
batch_size = 7

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.provider.webhook_secret.expose_secret() == "whsec-from-env",
                "env webhook secret should win over file and defaults",
            )?;
            ensure(config.conversation.worker_count == 6, "env worker count should win over file")?;
            ensure(config.conversation.batch_size == 7, "file batch size should win over default")?;
            Ok(())
        })();

        clear_vars(&[
            "RINGBACK_DATABASE_URL",
            "RINGBACK_PROVIDER_WEBHOOK_SECRET",
            "RINGBACK_CONVERSATION_WORKER_COUNT",
        ]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("provider.webhook_secret")
        );
        ensure(has_message, "validation failure should mention provider.webhook_secret")
    }

    #[test]
    fn invalid_quiet_hours_are_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("ringback.toml");
        fs::write(
            &path,
            r#"
[provider]
verify_signatures = false

[compliance]
quiet_hours_start = "9pm"
quiet_hours_end = "08:00"
"#,
        )
        .map_err(|err| err.to_string())?;

        let result =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() });
        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("9pm")),
            "malformed quiet hours should fail validation",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RINGBACK_PROVIDER_WEBHOOK_SECRET", "whsec-secret-value");
        env::set_var("RINGBACK_PROVIDER_API_KEY", "key-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("whsec-secret-value"),
                "debug output should not contain the webhook secret",
            )?;
            ensure(!debug.contains("key-secret-value"), "debug output should not contain the api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            ensure(config.retry.policy().max_attempts == 5, "default retry ceiling is five")?;
            Ok(())
        })();

        clear_vars(&["RINGBACK_PROVIDER_WEBHOOK_SECRET", "RINGBACK_PROVIDER_API_KEY"]);
        result
    }
}
