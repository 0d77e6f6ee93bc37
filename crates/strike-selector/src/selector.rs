use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use opt_trade_core::{InstrumentRow, OptionSide, SecurityConfig};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::info;

/// One tradable option leg resolved from the instrument dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionLeg {
    pub token: i64,
    pub symbol: String,
}

/// Strikes bracketing the current price, with their resolved legs.
///
/// `pre_next..next` are the four strikes the signal policy reads; `strikes`
/// holds the full target set including any extra wall-detection strikes.
#[derive(Debug, Clone, PartialEq)]
pub struct StrikeWindow {
    pub underlying: String,
    pub pre_next: i64,
    pub pre_nearest: i64,
    pub nearest: i64,
    pub next: i64,
    pub strikes: Vec<i64>,
    legs: HashMap<(i64, OptionSide), OptionLeg>,
}

impl StrikeWindow {
    /// Builds a window directly from already-resolved legs. The selector is
    /// the normal producer; this exists for paper setups and fixtures.
    #[must_use]
    pub fn from_legs(
        underlying: &str,
        nearest: i64,
        step: i64,
        legs: HashMap<(i64, OptionSide), OptionLeg>,
    ) -> Self {
        let mut strikes: Vec<i64> = legs.keys().map(|(strike, _)| *strike).collect();
        strikes.sort_unstable();
        strikes.dedup();
        Self {
            underlying: underlying.to_string(),
            pre_next: nearest - 2 * step,
            pre_nearest: nearest - step,
            nearest,
            next: nearest + step,
            strikes,
            legs,
        }
    }

    #[must_use]
    pub fn leg(&self, strike: i64, side: OptionSide) -> Option<&OptionLeg> {
        self.legs.get(&(strike, side))
    }

    #[must_use]
    pub fn token(&self, strike: i64, side: OptionSide) -> Option<i64> {
        self.leg(strike, side).map(|leg| leg.token)
    }

    #[must_use]
    pub fn contains_token(&self, token: i64) -> bool {
        self.leg_by_token(token).is_some()
    }

    #[must_use]
    pub fn leg_by_token(&self, token: i64) -> Option<&OptionLeg> {
        self.legs.values().find(|leg| leg.token == token)
    }

    /// All leg tokens, sorted, for feed subscription.
    #[must_use]
    pub fn tokens(&self) -> Vec<i64> {
        let mut tokens: Vec<i64> = self.legs.values().map(|leg| leg.token).collect();
        tokens.sort_unstable();
        tokens.dedup();
        tokens
    }

    /// Legs of one side ordered by strike, ascending.
    #[must_use]
    pub fn legs_of(&self, side: OptionSide) -> Vec<(i64, &OptionLeg)> {
        let mut legs: Vec<(i64, &OptionLeg)> = self
            .legs
            .iter()
            .filter(|((_, leg_side), _)| *leg_side == side)
            .map(|((strike, _), leg)| (*strike, leg))
            .collect();
        legs.sort_unstable_by_key(|(strike, _)| *strike);
        legs
    }
}

/// Resolves an underlying's current price to a window of tradable option
/// strikes, using the exchange trading-symbol convention.
///
/// Weekly symbols carry a single-character month code and a two-digit day
/// (`NIFTY2532022400CE`); in expiry week the exchange switches to the
/// monthly form with a three-letter month (`NIFTY25MAR22400CE`).
pub struct StrikeSelector {
    security: SecurityConfig,
    instruments: Vec<InstrumentRow>,
    cached: Option<StrikeWindow>,
}

impl StrikeSelector {
    #[must_use]
    pub fn new(security: SecurityConfig, instruments: &[InstrumentRow]) -> Self {
        let instruments: Vec<InstrumentRow> = instruments
            .iter()
            .filter(|row| {
                row.name == security.symbol
                    && (row.instrument_type == "CE" || row.instrument_type == "PE")
            })
            .cloned()
            .collect();
        Self {
            security,
            instruments,
            cached: None,
        }
    }

    /// Builds the strike window around `current_price`, reusing the cached
    /// window while the target strike set is unchanged.
    ///
    /// # Errors
    /// Returns an error when any of the four bracketing strikes has no
    /// tradable CE or PE instrument.
    pub fn resolve(
        &mut self,
        current_price: Decimal,
        today: NaiveDate,
        extra_strikes: u32,
    ) -> Result<StrikeWindow> {
        let step = i64::from(self.security.strike_step);
        let nearest = nearest_strike(current_price, self.security.strike_step)
            .with_context(|| format!("cannot derive a strike from price {current_price}"))?;
        let strikes = target_strikes(nearest, step, extra_strikes);

        if let Some(cached) = &self.cached {
            if cached.strikes == strikes {
                return Ok(cached.clone());
            }
        }

        let legs = self.match_legs(&strikes, today)?;
        let window = StrikeWindow {
            underlying: self.security.symbol.clone(),
            pre_next: nearest - 2 * step,
            pre_nearest: nearest - step,
            nearest,
            next: nearest + step,
            strikes,
            legs,
        };

        for strike in [
            window.pre_next,
            window.pre_nearest,
            window.nearest,
            window.next,
        ] {
            for side in [OptionSide::Call, OptionSide::Put] {
                if window.leg(strike, side).is_none() {
                    bail!(
                        "no tradable instrument for {} {strike} {side}",
                        self.security.symbol
                    );
                }
            }
        }

        info!(
            underlying = %self.security.symbol,
            nearest = window.nearest,
            legs = window.tokens().len(),
            "strike window resolved"
        );
        self.cached = Some(window.clone());
        Ok(window)
    }

    /// Whether `token` belongs to the currently cached window.
    #[must_use]
    pub fn owns_token(&self, token: i64) -> bool {
        self.cached
            .as_ref()
            .is_some_and(|window| window.contains_token(token))
    }

    fn match_legs(
        &self,
        strikes: &[i64],
        today: NaiveDate,
    ) -> Result<HashMap<(i64, OptionSide), OptionLeg>> {
        let symbol = regex::escape(&self.security.symbol);
        let strike_alt = strikes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|");
        let yy = today.year().rem_euclid(100);

        let (current_days, rollover) = lookahead_days(today);
        let mut patterns = Vec::new();
        if !current_days.is_empty() {
            patterns.push(day_pattern(
                &symbol,
                yy,
                today.month(),
                &current_days,
                &strike_alt,
            ));
        }
        patterns.push(month_pattern(&symbol, yy, today.month(), &strike_alt));
        if let Some((year, month, days)) = rollover {
            patterns.push(day_pattern(
                &symbol,
                year.rem_euclid(100),
                month,
                &days,
                &strike_alt,
            ));
        }

        for pattern in patterns {
            let legs = self.scan(&pattern)?;
            if !legs.is_empty() {
                return Ok(legs);
            }
        }
        Ok(HashMap::new())
    }

    fn scan(&self, pattern: &str) -> Result<HashMap<(i64, OptionSide), OptionLeg>> {
        let regex = Regex::new(pattern).context("strike symbol pattern")?;

        let mut matched: Vec<&InstrumentRow> = self
            .instruments
            .iter()
            .filter(|row| regex.is_match(&row.symbol))
            .collect();
        // Nearest expiry wins when two expiries match the same pattern.
        matched.sort_by_key(|row| row.expiry.unwrap_or(NaiveDate::MAX));

        let mut legs = HashMap::new();
        for row in matched {
            let Some(captures) = regex.captures(&row.symbol) else {
                continue;
            };
            let Some(strike) = captures
                .name("strike")
                .and_then(|m| m.as_str().parse::<i64>().ok())
            else {
                continue;
            };
            let side = match captures.name("side").map(|m| m.as_str()) {
                Some("CE") => OptionSide::Call,
                Some("PE") => OptionSide::Put,
                _ => continue,
            };
            legs.entry((strike, side)).or_insert_with(|| OptionLeg {
                token: row.token,
                symbol: row.symbol.clone(),
            });
        }
        Ok(legs)
    }
}

fn nearest_strike(price: Decimal, step: u32) -> Option<i64> {
    if step == 0 {
        return None;
    }
    let step = Decimal::from(step);
    ((price / step).floor() * step).to_i64()
}

fn target_strikes(nearest: i64, step: i64, extra_strikes: u32) -> Vec<i64> {
    let extra = i64::from(extra_strikes);
    let lowest = nearest - (2 + extra) * step;
    (0..4 + 2 * extra).map(|i| lowest + i * step).collect()
}

/// Seven-day lookahead split into (current-month days, rollover days).
fn lookahead_days(today: NaiveDate) -> (Vec<String>, Option<(i32, u32, Vec<String>)>) {
    let mut current = Vec::new();
    let mut rollover: Option<(i32, u32, Vec<String>)> = None;
    for offset in 0..7 {
        let date = today + Duration::days(offset);
        if date.month() == today.month() {
            current.push(format!("{:02}", date.day()));
        } else {
            let entry = rollover.get_or_insert((date.year(), date.month(), Vec::new()));
            entry.2.push(format!("{:02}", date.day()));
        }
    }
    (current, rollover)
}

fn day_pattern(symbol: &str, yy: i32, month: u32, days: &[String], strikes: &str) -> String {
    format!(
        "^{symbol}{yy:02}{}(?:{})(?P<strike>{strikes})(?P<side>CE|PE)$",
        month_code(month),
        days.join("|"),
    )
}

fn month_pattern(symbol: &str, yy: i32, month: u32, strikes: &str) -> String {
    format!(
        "^{symbol}{yy:02}{}(?P<strike>{strikes})(?P<side>CE|PE)$",
        month_abbrev(month),
    )
}

// Weekly symbols compress Oct/Nov/Dec to one letter.
fn month_code(month: u32) -> String {
    match month {
        10 => "O".to_string(),
        11 => "N".to_string(),
        12 => "D".to_string(),
        other => other.to_string(),
    }
}

fn month_abbrev(month: u32) -> &'static str {
    match month {
        1 => "JAN",
        2 => "FEB",
        3 => "MAR",
        4 => "APR",
        5 => "MAY",
        6 => "JUN",
        7 => "JUL",
        8 => "AUG",
        9 => "SEP",
        10 => "OCT",
        11 => "NOV",
        _ => "DEC",
    }
}
