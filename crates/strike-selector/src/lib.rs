pub mod selector;

pub use selector::{OptionLeg, StrikeSelector, StrikeWindow};
