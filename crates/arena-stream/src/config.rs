use std::str::FromStr;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::errors::ConfigError;

/// Pacing parameters for every per-agent pacer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacerConfig {
    /// Interval between two pacing ticks.
    pub tick_interval: Duration,
    /// Target output rate.
    pub chars_per_second: u32,
    /// Backlog size (in chars) that forces an immediate flush.
    pub backlog_ceiling: usize,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            chars_per_second: 50,
            backlog_ceiling: 1000,
        }
    }
}

impl PacerConfig {
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn chars_per_second(mut self, rate: u32) -> Self {
        self.chars_per_second = rate;
        self
    }

    pub fn backlog_ceiling(mut self, ceiling: usize) -> Self {
        self.backlog_ceiling = ceiling;
        self
    }

    /// Character budget of one tick, never below one.
    pub fn chars_per_tick(&self) -> usize {
        let per_tick =
            u128::from(self.chars_per_second) * self.tick_interval.as_millis() / 1000;
        usize::try_from(per_tick).unwrap_or(usize::MAX).max(1)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.tick_interval.is_zero() {
            return Err("pacer tick_interval must be greater than 0".into());
        }
        if self.chars_per_second == 0 {
            return Err("pacer chars_per_second must be greater than 0".into());
        }
        if self.backlog_ceiling == 0 {
            return Err("pacer backlog_ceiling must be greater than 0".into());
        }
        Ok(())
    }
}

/// Backend flavor behind the push transport.
///
/// Flavors differ in stream URL shape, the resume query parameter, and how
/// aggressively a dropped connection is retried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendFlavor {
    /// Edge gateway: cheap reconnects, retried fast and often.
    #[default]
    Gateway,
    /// Direct backend connection: slower and fewer retries.
    Direct,
}

impl BackendFlavor {
    pub fn reconnect_policy(self) -> ReconnectPolicy {
        match self {
            Self::Gateway => {
                ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(8), 8)
            }
            Self::Direct => {
                ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(30), 4)
            }
        }
    }

    pub(crate) fn stream_path(self, run_id: &str) -> String {
        match self {
            Self::Gateway => "/stream".to_string(),
            Self::Direct => format!("/runs/{run_id}/events/stream"),
        }
    }

    pub(crate) fn run_query_param(self) -> Option<&'static str> {
        match self {
            Self::Gateway => Some("runId"),
            Self::Direct => None,
        }
    }

    pub(crate) fn resume_query_param(self) -> &'static str {
        match self {
            Self::Gateway => "since",
            Self::Direct => "after",
        }
    }
}

impl FromStr for BackendFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gateway" => Ok(Self::Gateway),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown backend flavor `{other}`")),
        }
    }
}

/// Configuration for the push (server-sent events) transport.
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub base_url: String,
    pub flavor: BackendFlavor,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
    /// Longest silence (no bytes, not even a heartbeat) before the stream is
    /// treated as lost.
    pub idle_timeout: Duration,
    /// Overrides the flavor's reconnect policy.
    pub policy: Option<ReconnectPolicy>,
}

impl PushConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            flavor: BackendFlavor::default(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(45),
            policy: None,
        }
    }

    pub fn flavor(mut self, flavor: BackendFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.policy.unwrap_or_else(|| self.flavor.reconnect_policy())
    }
}

/// Configuration for the polling transport.
#[derive(Clone, Debug)]
pub struct PollConfig {
    pub base_url: String,
    /// Fixed delay between two polls, successful or not.
    pub interval: Duration,
    pub request_timeout: Duration,
    pub policy: ReconnectPolicy,
}

impl PollConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            policy: ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 3),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Which transport variant to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Push,
    Poll,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" | "sse" => Ok(Self::Push),
            "poll" => Ok(Self::Poll),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}

/// Coordinator-level settings.
#[derive(Clone, Debug, Default)]
pub struct CoordinatorConfig {
    pub pacer: PacerConfig,
}

impl CoordinatorConfig {
    pub fn pacer(mut self, pacer: PacerConfig) -> Self {
        self.pacer = pacer;
        self
    }
}

/// Complete configuration assembled from the environment.
#[derive(Clone, Debug)]
pub struct ArenaConfig {
    pub transport: TransportKind,
    pub push: PushConfig,
    pub poll: PollConfig,
    pub coordinator: CoordinatorConfig,
}

impl ArenaConfig {
    /// Creates a config with defaults for every transport pointed at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            transport: TransportKind::default(),
            push: PushConfig::new(base_url.clone()),
            poll: PollConfig::new(base_url),
            coordinator: CoordinatorConfig::default(),
        }
    }

    /// Builds a config from `ARENA_*` environment variables.
    ///
    /// - `ARENA_BASE_URL` (required)
    /// - `ARENA_TRANSPORT`: `push` (default) or `poll`
    /// - `ARENA_BACKEND_FLAVOR`: `gateway` (default) or `direct`
    /// - `ARENA_PUSH_IDLE_TIMEOUT_MS`, `ARENA_POLL_INTERVAL_MS`, `ARENA_TICK_MS`,
    ///   `ARENA_CHARS_PER_SECOND`, `ARENA_BACKLOG_CEILING`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(None, |key| std::env::var(key).ok())
    }

    /// Same as [`ArenaConfig::from_env`] with variables served by `lookup`.
    ///
    /// An explicit `base_url` wins over `ARENA_BASE_URL`, which then becomes
    /// optional; every other variable still applies.
    pub fn from_vars(
        base_url: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let base_url = base_url
            .map(str::to_string)
            .or_else(|| lookup("ARENA_BASE_URL"))
            .unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ConfigError::Missing("ARENA_BASE_URL"));
        }
        let mut config = Self::new(base_url.trim());

        if let Some(kind) = parse_var::<TransportKind>(&lookup, "ARENA_TRANSPORT")? {
            config.transport = kind;
        }
        if let Some(flavor) = parse_var::<BackendFlavor>(&lookup, "ARENA_BACKEND_FLAVOR")? {
            config.push.flavor = flavor;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "ARENA_PUSH_IDLE_TIMEOUT_MS")? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: "ARENA_PUSH_IDLE_TIMEOUT_MS",
                    message: "must be greater than 0".into(),
                });
            }
            config.push.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "ARENA_POLL_INTERVAL_MS")? {
            config.poll.interval = Duration::from_millis(ms);
        }

        let mut pacer = PacerConfig::default();
        if let Some(ms) = parse_var::<u64>(&lookup, "ARENA_TICK_MS")? {
            pacer.tick_interval = Duration::from_millis(ms);
        }
        if let Some(rate) = parse_var::<u32>(&lookup, "ARENA_CHARS_PER_SECOND")? {
            pacer.chars_per_second = rate;
        }
        if let Some(ceiling) = parse_var::<usize>(&lookup, "ARENA_BACKLOG_CEILING")? {
            pacer.backlog_ceiling = ceiling;
        }
        pacer.validate().map_err(|message| ConfigError::Invalid {
            key: "ARENA_PACER",
            message,
        })?;
        config.coordinator.pacer = pacer;
        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key,
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pacer_targets_fifty_chars_per_second() {
        let pacer = PacerConfig::default();
        assert_eq!(pacer.chars_per_tick(), 5);
        assert_eq!(pacer.backlog_ceiling, 1000);
    }

    #[test]
    fn chars_per_tick_never_drops_to_zero() {
        let pacer = PacerConfig::default()
            .chars_per_second(1)
            .tick_interval(Duration::from_millis(10));
        assert_eq!(pacer.chars_per_tick(), 1);
    }

    #[test]
    fn flavors_carry_distinct_retry_budgets() {
        let gateway = BackendFlavor::Gateway.reconnect_policy();
        let direct = BackendFlavor::Direct.reconnect_policy();
        assert!(gateway.base < direct.base);
        assert!(gateway.max_attempts > direct.max_attempts);
    }

    #[test]
    fn push_policy_override_wins_over_flavor() {
        let custom = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 1);
        let config = PushConfig::new("http://localhost")
            .flavor(BackendFlavor::Direct)
            .policy(custom);
        assert_eq!(config.reconnect_policy(), custom);
    }

    #[test]
    fn parses_transport_and_flavor_names() {
        assert_eq!("POLL".parse::<TransportKind>(), Ok(TransportKind::Poll));
        assert_eq!("sse".parse::<TransportKind>(), Ok(TransportKind::Push));
        assert_eq!(" direct ".parse::<BackendFlavor>(), Ok(BackendFlavor::Direct));
        assert!("carrier-pigeon".parse::<BackendFlavor>().is_err());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn variables_configure_every_layer() {
        let config = ArenaConfig::from_vars(
            None,
            vars(&[
                ("ARENA_BASE_URL", " http://arena.test "),
                ("ARENA_TRANSPORT", "poll"),
                ("ARENA_BACKEND_FLAVOR", "direct"),
                ("ARENA_PUSH_IDLE_TIMEOUT_MS", "5000"),
                ("ARENA_CHARS_PER_SECOND", "80"),
            ]),
        )
        .expect("config");
        assert_eq!(config.transport, TransportKind::Poll);
        assert_eq!(config.push.base_url, "http://arena.test");
        assert_eq!(config.push.flavor, BackendFlavor::Direct);
        assert_eq!(config.push.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.coordinator.pacer.chars_per_second, 80);
    }

    #[test]
    fn explicit_base_url_keeps_the_other_variables() {
        let config = ArenaConfig::from_vars(
            Some("http://flag.test"),
            vars(&[
                ("ARENA_BASE_URL", "http://env.test"),
                ("ARENA_TRANSPORT", "poll"),
            ]),
        )
        .expect("config");
        assert_eq!(config.poll.base_url, "http://flag.test");
        assert_eq!(config.push.base_url, "http://flag.test");
        assert_eq!(config.transport, TransportKind::Poll);

        let without_env = ArenaConfig::from_vars(Some("http://flag.test"), vars(&[]));
        assert!(without_env.is_ok());
    }

    #[test]
    fn missing_base_url_and_bad_values_are_reported() {
        assert_eq!(
            ArenaConfig::from_vars(None, vars(&[])).expect_err("missing"),
            ConfigError::Missing("ARENA_BASE_URL")
        );
        let err = ArenaConfig::from_vars(
            None,
            vars(&[("ARENA_BASE_URL", "http://a.test"), ("ARENA_TICK_MS", "soon")]),
        )
        .expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid { key: "ARENA_TICK_MS", .. }));
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(PacerConfig::default().chars_per_second(0).validate().is_err());
    }
}
