use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Per-position exit rules. Every `*_percent` field is in whole percent
/// (20.0 = 20%); `partial_exit_fraction` is a fraction of the position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitPolicy {
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub partial_take_percent: f64,
    pub partial_exit_fraction: f64,
    pub trailing_activation_percent: f64,
    pub trailing_stop_percent: f64,
    pub min_hold_minutes: i64,
    pub max_hold_hours: i64,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            stop_loss_percent: 20.0,
            take_profit_percent: 100.0,
            partial_take_percent: 50.0,
            partial_exit_fraction: 0.5,
            trailing_activation_percent: 30.0,
            trailing_stop_percent: 15.0,
            min_hold_minutes: 2,
            max_hold_hours: 24,
        }
    }
}

/// Account-wide guardrails.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    /// Daily realized loss ceiling, in base currency.
    pub max_daily_loss: f64,
    pub max_drawdown_percent: f64,
    pub max_exposure_percent: f64,
    pub max_position_percent: f64,
    pub min_trade_spacing: Duration,
    pub max_consecutive_losses: u32,
    pub cooldown: Duration,
    /// Smallest position the sizer will return.
    pub floor_position_size: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: 0.5,
            max_drawdown_percent: 30.0,
            max_exposure_percent: 60.0,
            max_position_percent: 10.0,
            min_trade_spacing: Duration::from_secs(60),
            max_consecutive_losses: 3,
            cooldown: Duration::from_secs(60 * 60),
            floor_position_size: 0.01,
        }
    }
}

/// Capital-survival thresholds. Watermarks are fractions of `target_capital`.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalConfig {
    pub target_capital: f64,
    pub low_watermark_fraction: f64,
    pub critical_watermark_fraction: f64,
    pub emergency_sell_fraction: f64,
    pub critical_sell_fraction: f64,
    pub profit_reserve_fraction: f64,
    pub min_reserve_trade: f64,
    /// Asset bought with earmarked profit. `None` disables reserve purchases.
    pub reserve_asset: Option<String>,
}

impl Default for SurvivalConfig {
    fn default() -> Self {
        Self {
            target_capital: 5.0,
            low_watermark_fraction: 0.2,
            critical_watermark_fraction: 0.1,
            emergency_sell_fraction: 0.2,
            critical_sell_fraction: 0.1,
            profit_reserve_fraction: 0.3,
            min_reserve_trade: 0.05,
            reserve_asset: None,
        }
    }
}

impl SurvivalConfig {
    pub fn low_watermark(&self) -> f64 {
        self.target_capital * self.low_watermark_fraction
    }

    pub fn critical_watermark(&self) -> f64 {
        self.target_capital * self.critical_watermark_fraction
    }
}

/// Live price stream settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// WebSocket endpoint. `None` leaves the agent on polling only.
    pub url: Option<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub requests_per_minute: u32,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dexscreener.com/latest/dex".to_string(),
            requests_per_minute: 240,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Agent loop and paper-execution knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub tick_interval: Duration,
    pub urgent_channel_capacity: usize,
    pub max_entries_per_tick: usize,
    /// Multiplier on the base entry amount while in conservative mode.
    pub conservative_size_factor: f64,
    /// Trailing-gap multiplier applied when the mode degrades.
    pub conservative_stop_factor: f64,
    /// A streamed price older than this is ignored in favour of polling.
    pub live_price_max_age: Duration,
    pub persist_debounce: Duration,
    pub paper_starting_balance: f64,
    pub paper_slippage_bps: f64,
    pub paper_fee_bps: f64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            urgent_channel_capacity: 64,
            max_entries_per_tick: 1,
            conservative_size_factor: 0.5,
            conservative_stop_factor: 0.5,
            live_price_max_age: Duration::from_secs(15),
            persist_debounce: Duration::from_secs(2),
            paper_starting_balance: 10.0,
            paper_slippage_bps: 100.0,
            paper_fee_bps: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub exit: ExitPolicy,
    pub risk: RiskLimits,
    pub survival: SurvivalConfig,
    pub feed: FeedConfig,
    pub market_data: MarketDataConfig,
    pub agent: AgentSettings,
    pub database_url: String,
    pub api_bind: String,
    pub api_requests_per_minute: u32,
    /// Endpoint returning entry candidates. `None` means exit-only operation.
    pub entry_signal_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            exit: ExitPolicy::default(),
            risk: RiskLimits::default(),
            survival: SurvivalConfig::default(),
            feed: FeedConfig::default(),
            market_data: MarketDataConfig::default(),
            agent: AgentSettings::default(),
            database_url: "sqlite://data/holdfast.db".to_string(),
            api_bind: "127.0.0.1:8080".to_string(),
            api_requests_per_minute: 120,
            entry_signal_url: None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Reads `name` through `lookup` and keeps `current` when the variable is
/// absent, unparsable or outside `valid`.
fn read_var<T, F>(lookup: &F, name: &str, current: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return current;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} (out of range), using default: {}",
                name,
                value,
                current
            );
            current
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                current
            );
            current
        }
    }
}

fn read_secs<F>(lookup: &F, name: &str, current: Duration, min: u64, max: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let secs = read_var(lookup, name, current.as_secs(), |v| (min..=max).contains(v));
    Duration::from_secs(secs)
}

fn read_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AgentConfig {
    /// Load configuration from `HOLDFAST_*` environment variables.
    pub fn from_env() -> AgentConfig {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AgentConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AgentConfig::default();
        let l = &lookup;

        let exit = &mut config.exit;
        exit.stop_loss_percent = read_var(l, "HOLDFAST_STOP_LOSS_PERCENT", exit.stop_loss_percent, |v| {
            *v > 0.0 && *v < 100.0
        });
        exit.take_profit_percent =
            read_var(l, "HOLDFAST_TAKE_PROFIT_PERCENT", exit.take_profit_percent, |v| *v > 0.0);
        exit.partial_take_percent =
            read_var(l, "HOLDFAST_PARTIAL_TAKE_PERCENT", exit.partial_take_percent, |v| *v > 0.0);
        exit.partial_exit_fraction = read_var(
            l,
            "HOLDFAST_PARTIAL_EXIT_FRACTION",
            exit.partial_exit_fraction,
            |v| *v > 0.0 && *v < 1.0,
        );
        exit.trailing_activation_percent = read_var(
            l,
            "HOLDFAST_TRAILING_ACTIVATION_PERCENT",
            exit.trailing_activation_percent,
            |v| *v > 0.0,
        );
        exit.trailing_stop_percent = read_var(
            l,
            "HOLDFAST_TRAILING_STOP_PERCENT",
            exit.trailing_stop_percent,
            |v| *v > 0.0 && *v < 100.0,
        );
        exit.min_hold_minutes =
            read_var(l, "HOLDFAST_MIN_HOLD_MINUTES", exit.min_hold_minutes, |v| *v >= 0);
        exit.max_hold_hours =
            read_var(l, "HOLDFAST_MAX_HOLD_HOURS", exit.max_hold_hours, |v| *v > 0);

        let risk = &mut config.risk;
        risk.max_daily_loss =
            read_var(l, "HOLDFAST_MAX_DAILY_LOSS", risk.max_daily_loss, |v| *v > 0.0);
        risk.max_drawdown_percent = read_var(
            l,
            "HOLDFAST_MAX_DRAWDOWN_PERCENT",
            risk.max_drawdown_percent,
            |v| *v > 0.0 && *v <= 100.0,
        );
        risk.max_exposure_percent = read_var(
            l,
            "HOLDFAST_MAX_EXPOSURE_PERCENT",
            risk.max_exposure_percent,
            |v| *v > 0.0 && *v <= 100.0,
        );
        risk.max_position_percent = read_var(
            l,
            "HOLDFAST_MAX_POSITION_PERCENT",
            risk.max_position_percent,
            |v| *v > 0.0 && *v <= 100.0,
        );
        risk.min_trade_spacing =
            read_secs(l, "HOLDFAST_MIN_TRADE_SPACING_SECS", risk.min_trade_spacing, 0, 86_400);
        risk.max_consecutive_losses = read_var(
            l,
            "HOLDFAST_MAX_CONSECUTIVE_LOSSES",
            risk.max_consecutive_losses,
            |v| (1..=50).contains(v),
        );
        risk.cooldown = Duration::from_secs(
            read_var(
                l,
                "HOLDFAST_COOLDOWN_MINUTES",
                risk.cooldown.as_secs() / 60,
                |v| (1..=10_080).contains(v),
            ) * 60,
        );
        risk.floor_position_size =
            read_var(l, "HOLDFAST_FLOOR_POSITION_SIZE", risk.floor_position_size, |v| *v >= 0.0);

        let survival = &mut config.survival;
        survival.target_capital =
            read_var(l, "HOLDFAST_TARGET_CAPITAL", survival.target_capital, |v| *v > 0.0);
        survival.low_watermark_fraction = read_var(
            l,
            "HOLDFAST_LOW_WATERMARK_FRACTION",
            survival.low_watermark_fraction,
            |v| *v > 0.0 && *v <= 1.0,
        );
        survival.critical_watermark_fraction = read_var(
            l,
            "HOLDFAST_CRITICAL_WATERMARK_FRACTION",
            survival.critical_watermark_fraction,
            |v| *v > 0.0 && *v <= 1.0,
        );
        survival.emergency_sell_fraction = read_var(
            l,
            "HOLDFAST_EMERGENCY_SELL_FRACTION",
            survival.emergency_sell_fraction,
            |v| *v > 0.0 && *v <= 1.0,
        );
        survival.critical_sell_fraction = read_var(
            l,
            "HOLDFAST_CRITICAL_SELL_FRACTION",
            survival.critical_sell_fraction,
            |v| *v > 0.0 && *v <= 1.0,
        );
        survival.profit_reserve_fraction = read_var(
            l,
            "HOLDFAST_PROFIT_RESERVE_FRACTION",
            survival.profit_reserve_fraction,
            |v| (0.0..=1.0).contains(v),
        );
        survival.min_reserve_trade =
            read_var(l, "HOLDFAST_MIN_RESERVE_TRADE", survival.min_reserve_trade, |v| *v >= 0.0);
        survival.reserve_asset = read_string(l, "HOLDFAST_RESERVE_ASSET");

        let feed = &mut config.feed;
        feed.url = read_string(l, "HOLDFAST_FEED_URL");
        feed.heartbeat_interval =
            read_secs(l, "HOLDFAST_HEARTBEAT_INTERVAL_SECS", feed.heartbeat_interval, 1, 600);
        feed.heartbeat_timeout =
            read_secs(l, "HOLDFAST_HEARTBEAT_TIMEOUT_SECS", feed.heartbeat_timeout, 1, 1200);
        feed.reconnect_base_delay =
            read_secs(l, "HOLDFAST_RECONNECT_BASE_DELAY_SECS", feed.reconnect_base_delay, 1, 300);
        feed.max_reconnect_attempts = read_var(
            l,
            "HOLDFAST_MAX_RECONNECT_ATTEMPTS",
            feed.max_reconnect_attempts,
            |v| (1..=100).contains(v),
        );

        let market = &mut config.market_data;
        if let Some(url) = read_string(l, "HOLDFAST_MARKET_DATA_URL") {
            market.base_url = url.trim_end_matches('/').to_string();
        }
        market.requests_per_minute = read_var(
            l,
            "HOLDFAST_MARKET_DATA_REQUESTS_PER_MINUTE",
            market.requests_per_minute,
            |v| (1..=10_000).contains(v),
        );
        market.max_retries =
            read_var(l, "HOLDFAST_MARKET_DATA_MAX_RETRIES", market.max_retries, |v| *v <= 10);

        let agent = &mut config.agent;
        agent.tick_interval =
            read_secs(l, "HOLDFAST_TICK_INTERVAL_SECS", agent.tick_interval, 1, 3600);
        agent.max_entries_per_tick = read_var(
            l,
            "HOLDFAST_MAX_ENTRIES_PER_TICK",
            agent.max_entries_per_tick,
            |v| *v <= 20,
        );
        agent.conservative_stop_factor = read_var(
            l,
            "HOLDFAST_CONSERVATIVE_STOP_FACTOR",
            agent.conservative_stop_factor,
            |v| *v > 0.0 && *v <= 1.0,
        );
        agent.live_price_max_age =
            read_secs(l, "HOLDFAST_LIVE_PRICE_MAX_AGE_SECS", agent.live_price_max_age, 1, 600);
        agent.paper_starting_balance = read_var(
            l,
            "HOLDFAST_PAPER_STARTING_BALANCE",
            agent.paper_starting_balance,
            |v| *v > 0.0,
        );

        if let Some(url) = read_string(l, "HOLDFAST_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(bind) = read_string(l, "HOLDFAST_API_BIND") {
            config.api_bind = bind;
        }
        config.api_requests_per_minute = read_var(
            l,
            "HOLDFAST_API_REQUESTS_PER_MINUTE",
            config.api_requests_per_minute,
            |v| *v > 0,
        );
        config.entry_signal_url = read_string(l, "HOLDFAST_ENTRY_SIGNAL_URL");

        config
    }

    /// Cross-field checks that individual range checks cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.survival.critical_watermark_fraction >= self.survival.low_watermark_fraction {
            return Err(ConfigError::Invalid(format!(
                "critical watermark ({}) must be below low watermark ({})",
                self.survival.critical_watermark_fraction, self.survival.low_watermark_fraction
            )));
        }
        if self.feed.heartbeat_timeout <= self.feed.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "heartbeat timeout ({:?}) must exceed heartbeat interval ({:?})",
                self.feed.heartbeat_timeout, self.feed.heartbeat_interval
            )));
        }
        if self.exit.partial_take_percent >= self.exit.take_profit_percent {
            tracing::warn!(
                "Partial take ({}%) is not below take-profit ({}%); partial exits will never fire",
                self.exit.partial_take_percent,
                self.exit.take_profit_percent
            );
        }
        if self.risk.max_position_percent > self.risk.max_exposure_percent {
            return Err(ConfigError::Invalid(format!(
                "per-position ceiling ({}%) exceeds exposure ceiling ({}%)",
                self.risk.max_position_percent, self.risk.max_exposure_percent
            )));
        }
        Ok(())
    }
}
