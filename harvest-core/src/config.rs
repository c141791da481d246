use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::Error;
use crate::Result;

const ENV_SOURCE_DOMAIN: &str = "HARVEST_SOURCE_DOMAIN";
const ENV_SOURCE_BASE_URL: &str = "HARVEST_SOURCE_BASE_URL";
const ENV_API_KEY: &str = "HARVEST_API_KEY";
const ENV_POLL_PERIOD_SECS: &str = "HARVEST_POLL_PERIOD_SECS";
const ENV_PAGE_LIMIT: &str = "HARVEST_PAGE_LIMIT";
const ENV_MAX_PAGES: &str = "HARVEST_MAX_PAGES";
const ENV_SHUTDOWN_TIMEOUT_MS: &str = "HARVEST_SHUTDOWN_TIMEOUT_MS";
const ENV_START_TIME: &str = "HARVEST_START_TIME";
const ENV_INITIAL_LOOKBACK_SECS: &str = "HARVEST_INITIAL_LOOKBACK_SECS";
const ENV_FETCH_RETRY_ATTEMPTS: &str = "HARVEST_FETCH_RETRY_ATTEMPTS";
const ENV_FETCH_RETRY_INTERVAL_MS: &str = "HARVEST_FETCH_RETRY_INTERVAL_MS";
const ENV_REQUEST_TIMEOUT_MS: &str = "HARVEST_REQUEST_TIMEOUT_MS";
const ENV_SINK: &str = "HARVEST_SINK";
const ENV_SINK_URL: &str = "HARVEST_SINK_URL";
const ENV_SINK_BATCH_SIZE: &str = "HARVEST_SINK_BATCH_SIZE";
const ENV_SINK_CHANNEL_CAPACITY: &str = "HARVEST_SINK_CHANNEL_CAPACITY";
const ENV_SINK_RETRY_ATTEMPTS: &str = "HARVEST_SINK_RETRY_ATTEMPTS";
const ENV_SINK_RETRY_INTERVAL_MS: &str = "HARVEST_SINK_RETRY_INTERVAL_MS";
const ENV_CHECKPOINT_PATH: &str = "HARVEST_CHECKPOINT_PATH";
const ENV_METRICS_PORT: &str = "HARVEST_METRICS_PORT";

/// Placeholder shipped in deployment templates, never a usable value.
pub const PLACEHOLDER: &str = "FILLER";

const DEFAULT_POLL_PERIOD_SECS: u64 = 60;
const DEFAULT_PAGE_LIMIT: u32 = 1000;
const DEFAULT_MAX_PAGES: usize = 10_000;
const DEFAULT_FETCH_RETRY_INTERVAL_MS: u64 = 500;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SINK_BATCH_SIZE: usize = 100;
const DEFAULT_SINK_CHANNEL_CAPACITY: usize = 1000;
const DEFAULT_SINK_RETRY_ATTEMPTS: u16 = 5;
const DEFAULT_SINK_RETRY_INTERVAL_MS: u64 = 100;
const DEFAULT_METRICS_PORT: u16 = 2469;

/// Page walk settings of a poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub page_limit: u32,
    /// Guard against runaway pagination; a window needing more pages is abandoned.
    pub max_pages: usize,
    /// Retries of a transient fetch failure before the cycle is abandoned.
    pub retry_attempts: u16,
    pub retry_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            max_pages: DEFAULT_MAX_PAGES,
            retry_attempts: 0,
            retry_interval: Duration::from_millis(DEFAULT_FETCH_RETRY_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkType {
    Log,
    Blackhole,
    Http { url: String },
}

impl FromStr for SinkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(SinkType::Log),
            "blackhole" => Ok(SinkType::Blackhole),
            "http" => Err(Error::Config(format!(
                "{ENV_SINK}=http requires {ENV_SINK_URL}"
            ))),
            other => Err(Error::Config(format!("unknown sink type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub sink_type: SinkType,
    pub batch_size: usize,
    pub channel_capacity: usize,
    pub retry_attempts: u16,
    pub retry_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            sink_type: SinkType::Log,
            batch_size: DEFAULT_SINK_BATCH_SIZE,
            channel_capacity: DEFAULT_SINK_CHANNEL_CAPACITY,
            retry_attempts: DEFAULT_SINK_RETRY_ATTEMPTS,
            retry_interval: Duration::from_millis(DEFAULT_SINK_RETRY_INTERVAL_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct Settings {
    pub source_domain: String,
    /// Overrides `https://{source_domain}`, for proxies and local testing.
    pub source_base_url: Option<String>,
    pub api_key: String,
    pub request_timeout: Duration,
    pub poll_period: Duration,
    pub poll: PollConfig,
    /// `None` waits for the sink indefinitely, zero does not wait at all.
    pub shutdown_timeout: Option<Duration>,
    pub start_time: Option<DateTime<Utc>>,
    pub initial_lookback: Duration,
    pub sink: SinkConfig,
    pub checkpoint_path: Option<PathBuf>,
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source_domain: PLACEHOLDER.to_string(),
            source_base_url: None,
            api_key: PLACEHOLDER.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            poll_period: Duration::from_secs(DEFAULT_POLL_PERIOD_SECS),
            poll: PollConfig::default(),
            shutdown_timeout: None,
            start_time: None,
            initial_lookback: Duration::from_secs(DEFAULT_POLL_PERIOD_SECS),
            sink: SinkConfig::default(),
            checkpoint_path: None,
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("source_domain", &self.source_domain)
            .field("source_base_url", &self.source_base_url)
            .field("api_key", &"*****")
            .field("request_timeout", &self.request_timeout)
            .field("poll_period", &self.poll_period)
            .field("poll", &self.poll)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("start_time", &self.start_time)
            .field("initial_lookback", &self.initial_lookback)
            .field("sink", &self.sink)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

impl Settings {
    /// Loads the settings from the process environment.
    pub fn load() -> Result<Self> {
        let settings = Self::try_from(env::vars().collect::<HashMap<String, String>>())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings the harvester cannot start with.
    pub fn validate(&self) -> Result<()> {
        if is_unset(&self.api_key) {
            return Err(Error::Config(format!("{ENV_API_KEY} is not configured")));
        }
        if self.source_base_url.is_none() && is_unset(&self.source_domain) {
            return Err(Error::Config(format!("{ENV_SOURCE_DOMAIN} is not configured")));
        }
        if self.poll_period.is_zero() {
            return Err(Error::Config("poll period must be greater than zero".into()));
        }
        if self.poll.page_limit == 0 {
            return Err(Error::Config("page limit must be greater than zero".into()));
        }
        if self.poll.max_pages == 0 {
            return Err(Error::Config("max pages must be greater than zero".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be greater than zero".into()));
        }
        if self.sink.batch_size == 0 || self.sink.channel_capacity == 0 {
            return Err(Error::Config(
                "sink batch size and channel capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn is_unset(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == PLACEHOLDER
}

fn parse<T>(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_vars
        .get(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parsing {key}(set to '{value}'): {e}")))
        })
        .transpose()
}

/// Loads settings from a map of environment variables. Missing variables keep their defaults.
impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(domain) = env_vars.get(ENV_SOURCE_DOMAIN) {
            settings.source_domain = domain.trim().to_string();
        }
        if let Some(base_url) = env_vars.get(ENV_SOURCE_BASE_URL) {
            settings.source_base_url = Some(base_url.trim().to_string());
        }
        if let Some(api_key) = env_vars.get(ENV_API_KEY) {
            settings.api_key = api_key.trim().to_string();
        }

        if let Some(secs) = parse::<u64>(&env_vars, ENV_POLL_PERIOD_SECS)? {
            settings.poll_period = Duration::from_secs(secs);
        }
        // the first window covers one poll period unless told otherwise
        settings.initial_lookback = match parse::<u64>(&env_vars, ENV_INITIAL_LOOKBACK_SECS)? {
            Some(secs) => Duration::from_secs(secs),
            None => settings.poll_period,
        };
        if let Some(start) = env_vars.get(ENV_START_TIME) {
            let start = DateTime::parse_from_rfc3339(start.trim()).map_err(|e| {
                Error::Config(format!("Parsing {ENV_START_TIME}(set to '{start}'): {e}"))
            })?;
            settings.start_time = Some(start.with_timezone(&Utc));
        }

        if let Some(limit) = parse(&env_vars, ENV_PAGE_LIMIT)? {
            settings.poll.page_limit = limit;
        }
        if let Some(max_pages) = parse(&env_vars, ENV_MAX_PAGES)? {
            settings.poll.max_pages = max_pages;
        }
        if let Some(attempts) = parse(&env_vars, ENV_FETCH_RETRY_ATTEMPTS)? {
            settings.poll.retry_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&env_vars, ENV_FETCH_RETRY_INTERVAL_MS)? {
            settings.poll.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&env_vars, ENV_REQUEST_TIMEOUT_MS)? {
            settings.request_timeout = Duration::from_millis(ms);
            settings.sink.request_timeout = settings.request_timeout;
        }

        // negative means wait for as long as it takes
        settings.shutdown_timeout = match parse::<i64>(&env_vars, ENV_SHUTDOWN_TIMEOUT_MS)? {
            Some(ms) if ms >= 0 => Some(Duration::from_millis(ms.unsigned_abs())),
            _ => None,
        };

        settings.sink.sink_type = match (env_vars.get(ENV_SINK), env_vars.get(ENV_SINK_URL)) {
            (Some(kind), Some(url)) if kind.trim().eq_ignore_ascii_case("http") => {
                SinkType::Http {
                    url: url.trim().to_string(),
                }
            }
            (Some(kind), _) => kind.trim().parse()?,
            (None, _) => SinkType::Log,
        };
        if let Some(batch_size) = parse(&env_vars, ENV_SINK_BATCH_SIZE)? {
            settings.sink.batch_size = batch_size;
        }
        if let Some(capacity) = parse(&env_vars, ENV_SINK_CHANNEL_CAPACITY)? {
            settings.sink.channel_capacity = capacity;
        }
        if let Some(attempts) = parse(&env_vars, ENV_SINK_RETRY_ATTEMPTS)? {
            settings.sink.retry_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&env_vars, ENV_SINK_RETRY_INTERVAL_MS)? {
            settings.sink.retry_interval = Duration::from_millis(ms);
        }

        if let Some(path) = env_vars.get(ENV_CHECKPOINT_PATH) {
            settings.checkpoint_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(port) = parse(&env_vars, ENV_METRICS_PORT)? {
            settings.metrics_port = port;
        }

        Ok(settings)
    }
}
