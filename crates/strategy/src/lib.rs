//! Signal derivation for one underlying: candle refresh, rolling
//! indicators, candlestick classification, swing trend, and the per-bucket
//! decision over the option chain's open-interest picture.

pub mod indicators;
pub mod instrument;
pub mod patterns;
pub mod policy;
pub mod trend;

pub use indicators::IndicatorSeries;
pub use instrument::{AnalysisView, InstrumentState};
pub use policy::{chosen_tokens, decide, PolicyInputs, PCR_CALL_ENTRY, PCR_PUT_ENTRY};
pub use trend::TrendState;
