//! Tick ingestion and open-interest momentum analysis.
//!
//! [`TickIngestor`] is the hand-off point between the market-data feed task
//! and the decision loop; [`OiMomentumAnalyser`] turns the persisted tick
//! history into the PCR/OI-trend snapshot the signal policy reads.

pub mod ingestor;
pub mod momentum;

pub use ingestor::TickIngestor;
pub use momentum::{BetaPair, LegOiReading, OiMomentumAnalyser, OiMomentumSnapshot};
