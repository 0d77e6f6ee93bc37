pub mod broker;
pub mod bucket;
pub mod config;
pub mod config_loader;
pub mod market;
pub mod session;
pub mod signal;

pub use broker::{
    BrokerError, BrokerGateway, BrokerOrder, BrokerOrderKind, BrokerPosition, InstrumentRow,
    MarginSummary, OrderKind, OrderModify, OrderRequest, OrderSide, OrderStatus,
};
pub use bucket::TimeBucket;
pub use config::{AppConfig, DatabaseConfig, EngineConfig, KiteConfig, SecurityConfig};
pub use config_loader::ConfigLoader;
pub use market::{Candle, LatestQuote, OptionSide, Tick, TickSink, FRESHNESS_WINDOW_SECS};
pub use signal::{OiTrend, Signal, SignalAction, TrendDirection};
