use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub project_root: PathBuf,
    pub cache_max_age: Duration,
    pub cache_capacity: usize,
    pub cache_sweep_interval: Duration,
    pub slow_operation_threshold: Duration,
    pub batch_defer_threshold: usize,
    pub batch_chunk_size: usize,
    pub batch_window: Duration,
    pub analysis_debounce: Duration,
    pub request_timeout: Duration,
    pub change_history_limit: Option<usize>,
    pub outbound_log_capacity: usize,
    pub builtin_analyzer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            project_root: PathBuf::from("."),
            cache_max_age: Duration::from_secs(5 * 60),
            cache_capacity: 256,
            cache_sweep_interval: Duration::from_secs(60),
            slow_operation_threshold: Duration::from_millis(100),
            batch_defer_threshold: 20,
            batch_chunk_size: 20,
            batch_window: Duration::from_millis(150),
            analysis_debounce: Duration::from_millis(300),
            request_timeout: Duration::from_secs(5),
            change_history_limit: None,
            outbound_log_capacity: 1024,
            builtin_analyzer: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind_raw = env::var("CODE_AWARENESS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or(defaults.bind_addr);

        let project_root = env::var("CODE_AWARENESS_PROJECT_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.project_root);

        let change_history_limit = parse_var::<usize>("CODE_AWARENESS_CHANGE_HISTORY_LIMIT")
            .filter(|limit| *limit > 0);

        let builtin_analyzer = env::var("CODE_AWARENESS_BUILTIN_ANALYZER")
            .ok()
            .map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(defaults.builtin_analyzer);

        Ok(Self {
            bind_addr,
            project_root,
            cache_max_age: secs_var("CODE_AWARENESS_CACHE_MAX_AGE_SECONDS")
                .unwrap_or(defaults.cache_max_age),
            cache_capacity: parse_var("CODE_AWARENESS_CACHE_CAPACITY")
                .unwrap_or(defaults.cache_capacity),
            cache_sweep_interval: secs_var("CODE_AWARENESS_CACHE_SWEEP_SECONDS")
                .unwrap_or(defaults.cache_sweep_interval),
            slow_operation_threshold: millis_var("CODE_AWARENESS_SLOW_OPERATION_MS")
                .unwrap_or(defaults.slow_operation_threshold),
            batch_defer_threshold: parse_var("CODE_AWARENESS_BATCH_DEFER_THRESHOLD")
                .unwrap_or(defaults.batch_defer_threshold),
            batch_chunk_size: parse_var::<usize>("CODE_AWARENESS_BATCH_CHUNK_SIZE")
                .map(|size| size.max(1))
                .unwrap_or(defaults.batch_chunk_size),
            batch_window: millis_var("CODE_AWARENESS_BATCH_WINDOW_MS")
                .unwrap_or(defaults.batch_window),
            analysis_debounce: millis_var("CODE_AWARENESS_ANALYSIS_DEBOUNCE_MS")
                .unwrap_or(defaults.analysis_debounce),
            request_timeout: millis_var("CODE_AWARENESS_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            change_history_limit,
            outbound_log_capacity: parse_var("CODE_AWARENESS_OUTBOUND_LOG_CAPACITY")
                .unwrap_or(defaults.outbound_log_capacity),
            builtin_analyzer,
        })
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn secs_var(name: &str) -> Option<Duration> {
    parse_var::<u64>(name).map(Duration::from_secs)
}

fn millis_var(name: &str) -> Option<Duration> {
    parse_var::<u64>(name).map(Duration::from_millis)
}
