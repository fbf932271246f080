mod amount;
pub mod helpers;
mod secret;

pub use amount::{Amount, AmountParseError, MINOR_UNITS_PER_UNIT};
pub use secret::Secret;
