use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub kite: KiteConfig,
    pub engine: EngineConfig,
    /// Underlyings the engine tracks and trades options on.
    #[serde(default)]
    pub securities: Vec<SecurityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiteConfig {
    pub api_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Decision loop cadence in seconds.
    pub loop_interval_secs: u64,
    /// Broker position polling throttle in seconds.
    pub reconcile_interval_secs: u64,
    /// How long an underlying sits out after a failed margin check.
    pub low_margin_backoff_secs: u64,
    /// Selects the covered-write policy instead of the long-only policy.
    pub selling_enabled: bool,
    /// Extra strikes resolved either side of the core window.
    pub extra_strikes: u32,
    /// Exchange segment for option instruments.
    pub exchange: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Underlying name as it prefixes option trading symbols, e.g. "NIFTY".
    pub symbol: String,
    /// Instrument token of the underlying index/stock.
    pub token: i64,
    /// Distance between adjacent option strikes.
    pub strike_step: u32,
    /// Contracts per entry order (lot size multiple).
    pub quantity: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/opt_trade".to_string(),
                max_connections: 10,
            },
            kite: KiteConfig {
                api_url: "https://api.kite.trade".to_string(),
                ws_url: "wss://ws.kite.trade".to_string(),
                api_key: String::new(),
                access_token: String::new(),
            },
            engine: EngineConfig {
                loop_interval_secs: 5,
                reconcile_interval_secs: 10,
                low_margin_backoff_secs: 300,
                selling_enabled: false,
                extra_strikes: 0,
                exchange: "NFO".to_string(),
            },
            securities: Vec::new(),
        }
    }
}
