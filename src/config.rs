use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Connection attempts for the store and the broker before startup gives up.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Fixed backoff between database connection attempts (seconds).
pub const DB_RETRY_BACKOFF_SECS: u64 = 10;

/// Fixed backoff between broker connection attempts (seconds).
pub const BROKER_RETRY_BACKOFF_SECS: u64 = 30;

/// Extra time granted on top of the server-side reserve timeout before the
/// client treats the connection as hung.
pub const RESERVE_GRACE_SECS: u64 = 5;

/// Tube every fresh beanstalkd connection watches; ignored by the consumer.
pub const DEFAULT_TUBE: &str = "default";

/// Checkpoint keys for the two scan cursors.
pub const CURSOR_KEY_MESSAGES: &str = "last_check_msg";
pub const CURSOR_KEY_PRODUCTS: &str = "last_check_product";

/// Message types eligible for crawling.
pub const MSG_TYPE_TEXT: i64 = 1;
pub const MSG_TYPE_LINK: i64 = 49;

/// Titles longer than this many characters are cut and suffixed with "...".
pub const TITLE_MAX_CHARS: usize = 30;

/// Minimum movement of either range bound that produces a notification.
pub const RANGE_NOTIFY_MIN_DELTA: f64 = 1.0;

/// Storage format for timestamps. Lexical order equals time order.
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp format of the notification envelope.
pub const NOTIFY_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// What happens to a reserved job whose body is not a task envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedJobPolicy {
    /// Keep it reserved; the broker releases it again once its TTR expires.
    Leave,
    /// Delete it from the broker.
    Delete,
}

impl std::str::FromStr for MalformedJobPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leave" => Ok(MalformedJobPolicy::Leave),
            "delete" => Ok(MalformedJobPolicy::Delete),
            other => Err(AppError::Config(format!(
                "MALFORMED_JOB_POLICY must be 'leave' or 'delete', got '{other}'"
            ))),
        }
    }
}

/// Language of rendered notification messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    Zh,
    En,
}

impl std::str::FromStr for Locale {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" => Ok(Locale::Zh),
            "en" | "en-us" => Ok(Locale::En),
            other => Err(AppError::Config(format!("NOTIFY_LOCALE '{other}' is not supported"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Main SQLite database holding msg/product/product_watch/product_update.
    pub db_path: String,
    /// Separate SQLite file for the scan cursors.
    pub checkpoint_path: String,
    /// Debug dumps of dispatched/received/notification payloads. None disables them.
    pub dump_dir: Option<PathBuf>,
    pub api_port: u16,
    pub beanstalk_host: String,
    pub beanstalk_port: u16,
    /// Tube crawl workers report results on (RESULT_TUBE)
    pub result_tube: String,
    /// Tube crawl tasks are dispatched to (TASK_TUBE)
    pub task_tube: String,
    /// Tube notification envelopes are put on (NOTIFY_TUBE)
    pub notify_tube: String,
    pub reserve_timeout: Duration,
    pub put_priority: u32,
    pub put_delay: Duration,
    pub put_ttr: Duration,
    /// Pause between the end of one cycle and the start of the next.
    pub polling_interval: Duration,
    /// Minimum age of last_dispatch_time before a product is offered again.
    /// None dispatches products regardless of when they were last sent.
    pub redispatch_interval: Option<Duration>,
    /// Maximum payloads per task envelope.
    pub batch_capacity: usize,
    pub malformed_job_policy: MalformedJobPolicy,
    pub locale: Locale,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_path: "hiprice.db".to_string(),
            checkpoint_path: "dispatcher.db".to_string(),
            dump_dir: Some(PathBuf::from("./dump")),
            api_port: 3000,
            beanstalk_host: "127.0.0.1".to_string(),
            beanstalk_port: 11300,
            result_tube: "crawl_result".to_string(),
            task_tube: "crawl_task".to_string(),
            notify_tube: "notification".to_string(),
            reserve_timeout: Duration::from_secs(5),
            put_priority: 1024,
            put_delay: Duration::ZERO,
            put_ttr: Duration::from_secs(120),
            polling_interval: Duration::from_secs(60),
            redispatch_interval: None,
            batch_capacity: 50,
            malformed_job_policy: MalformedJobPolicy::Leave,
            locale: Locale::Zh,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or(d.log_level),
            db_path: std::env::var("DB_PATH").unwrap_or(d.db_path),
            checkpoint_path: std::env::var("CHECKPOINT_PATH").unwrap_or(d.checkpoint_path),
            dump_dir: match std::env::var("DUMP_DIR") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => d.dump_dir,
            },
            api_port: parse_var("API_PORT", d.api_port)?,
            beanstalk_host: std::env::var("BEANSTALK_HOST").unwrap_or(d.beanstalk_host),
            beanstalk_port: parse_var("BEANSTALK_PORT", d.beanstalk_port)?,
            result_tube: std::env::var("RESULT_TUBE").unwrap_or(d.result_tube),
            task_tube: std::env::var("TASK_TUBE").unwrap_or(d.task_tube),
            notify_tube: std::env::var("NOTIFY_TUBE").unwrap_or(d.notify_tube),
            reserve_timeout: Duration::from_secs(parse_var(
                "RESERVE_TIMEOUT_SECS",
                d.reserve_timeout.as_secs(),
            )?),
            put_priority: parse_var("PUT_PRIORITY", d.put_priority)?,
            put_delay: Duration::from_secs(parse_var("PUT_DELAY_SECS", d.put_delay.as_secs())?),
            put_ttr: Duration::from_secs(parse_var("PUT_TTR_SECS", d.put_ttr.as_secs())?),
            polling_interval: Duration::from_secs(parse_var(
                "POLLING_INTERVAL_SECS",
                d.polling_interval.as_secs(),
            )?),
            redispatch_interval: match parse_var::<u64>("REDISPATCH_INTERVAL_MINS", 0)? {
                0 => None,
                mins => Some(Duration::from_secs(mins * 60)),
            },
            batch_capacity: parse_var("BATCH_CAPACITY", d.batch_capacity)?,
            malformed_job_policy: match std::env::var("MALFORMED_JOB_POLICY") {
                Ok(v) => v.parse()?,
                Err(_) => d.malformed_job_policy,
            },
            locale: match std::env::var("NOTIFY_LOCALE") {
                Ok(v) => v.parse()?,
                Err(_) => d.locale,
            },
        })
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.beanstalk_host, self.beanstalk_port)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name} must be a valid number, got '{v}'"))),
        Err(_) => Ok(default),
    }
}
