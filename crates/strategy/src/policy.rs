//! The per-bucket trading decision.
//!
//! Numeric thresholds here are the trading policy itself, expressed in open
//! interest contracts, index points and put-call-ratio units. They are fixed
//! on purpose; only the covered-write policy is switchable, via
//! configuration.

use opt_trade_core::{OptionSide, SignalAction, TrendDirection};
use opt_trade_signals::OiMomentumSnapshot;
use opt_trade_strike_selector::StrikeWindow;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// PCR above this reads as put-heavy support under the nearest strike.
/// Public because the order manager re-checks it against open calls.
pub const PCR_CALL_ENTRY: f64 = 1.5;
/// PCR below this reads as call-heavy resistance over the next strike.
pub const PCR_PUT_ENTRY: f64 = 0.75;
/// Open interest qualifying a strike as a wall for the long policies.
const OI_WALL: i64 = 7_500_000;
/// Minimum room between the spot price and the strike being traded toward.
const MIN_STRIKE_GAP: Decimal = dec!(30);

/// Covered-write thresholds; looser than the long policies.
const PCR_CALL_WRITE: f64 = 0.9;
const PCR_PUT_WRITE: f64 = 1.2;
const OI_WRITE_WALL: i64 = 5_000_000;

/// Everything one bucket's decision reads, already resolved.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs<'a> {
    pub window: &'a StrikeWindow,
    pub snapshot: &'a OiMomentumSnapshot,
    pub last_price: Decimal,
    pub trend: TrendDirection,
    pub is_bullish: bool,
    pub is_bearish: bool,
    pub is_buyable: bool,
    pub is_sellable: bool,
    pub selling_enabled: bool,
}

impl PolicyInputs<'_> {
    /// Points between the spot and the strike above it.
    fn next_gap(&self) -> Decimal {
        Decimal::from(self.window.next) - self.last_price
    }

    /// Points between the spot and the strike below it.
    fn nearest_gap(&self) -> Decimal {
        self.last_price - Decimal::from(self.window.nearest)
    }
}

/// Applies the decision table. Long entries outrank covered writes; the
/// write rules only run when the covered-write policy is enabled.
#[must_use]
pub fn decide(inputs: &PolicyInputs<'_>) -> SignalAction {
    if wants_long_call(inputs) {
        return SignalAction::BuyCall;
    }
    if wants_long_put(inputs) {
        return SignalAction::BuyPut;
    }
    if inputs.selling_enabled {
        if wants_call_write(inputs) {
            return SignalAction::SellCall;
        }
        if wants_put_write(inputs) {
            return SignalAction::SellPut;
        }
    }
    SignalAction::None
}

/// Put-side support building under the nearest strike while price still has
/// room to run into the next one.
fn wants_long_call(p: &PolicyInputs<'_>) -> bool {
    p.snapshot.pcr(p.window.nearest) > PCR_CALL_ENTRY
        && p.snapshot.oi(p.window.nearest, OptionSide::Put) > OI_WALL
        && p.next_gap() > MIN_STRIKE_GAP
        && (p.snapshot.oi(p.window.next, OptionSide::Call) < OI_WALL
            || p.snapshot.pcr(p.window.next) > PCR_CALL_ENTRY)
        && (p.trend == TrendDirection::Up || p.is_bullish)
        && p.is_buyable
        && p.snapshot.oi_building(p.window.nearest, OptionSide::Put)
}

/// Mirror of the long-call rule: call-side resistance building over the
/// next strike while price has room to fall to the nearest one.
fn wants_long_put(p: &PolicyInputs<'_>) -> bool {
    p.snapshot.pcr(p.window.next) < PCR_PUT_ENTRY
        && p.snapshot.oi(p.window.next, OptionSide::Call) > OI_WALL
        && p.nearest_gap() > MIN_STRIKE_GAP
        && (p.snapshot.oi(p.window.nearest, OptionSide::Put) < OI_WALL
            || p.snapshot.pcr(p.window.nearest) < PCR_PUT_ENTRY)
        && (p.trend == TrendDirection::Down || p.is_bearish)
        && p.is_sellable
        && p.snapshot.oi_building(p.window.next, OptionSide::Call)
}

/// Write calls into building call-side resistance on a falling market.
fn wants_call_write(p: &PolicyInputs<'_>) -> bool {
    p.snapshot.pcr(p.window.next) < PCR_CALL_WRITE
        && p.snapshot.oi(p.window.next, OptionSide::Call) > OI_WRITE_WALL
        && (p.trend == TrendDirection::Down || p.is_bearish)
        && p.snapshot.oi_building(p.window.next, OptionSide::Call)
}

/// Write puts into building put-side support on a rising market.
fn wants_put_write(p: &PolicyInputs<'_>) -> bool {
    p.snapshot.pcr(p.window.nearest) > PCR_PUT_WRITE
        && p.snapshot.oi(p.window.nearest, OptionSide::Put) > OI_WRITE_WALL
        && (p.trend == TrendDirection::Up || p.is_bullish)
        && p.snapshot.oi_building(p.window.nearest, OptionSide::Put)
}

/// Resolves the tokens a signal trades. Long signals take the nearest call
/// and the next put; writes take the max-OI wall on their own side.
#[must_use]
pub fn chosen_tokens(
    action: SignalAction,
    window: &StrikeWindow,
    snapshot: &OiMomentumSnapshot,
) -> (Option<i64>, Option<i64>) {
    let mut ce = window.token(window.nearest, OptionSide::Call);
    let mut pe = window.token(window.next, OptionSide::Put);
    match action {
        SignalAction::SellCall => {
            if let Some(strike) = snapshot.max_oi_strike(OptionSide::Call) {
                ce = window.token(strike, OptionSide::Call).or(ce);
            }
        }
        SignalAction::SellPut => {
            if let Some(strike) = snapshot.max_oi_strike(OptionSide::Put) {
                pe = window.token(strike, OptionSide::Put).or(pe);
            }
        }
        SignalAction::BuyCall | SignalAction::BuyPut | SignalAction::None => {}
    }
    (ce, pe)
}
