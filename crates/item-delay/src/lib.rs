//! # Item Delay
//!
//! Parses item update intervals and computes when an item is checked next.
//!
//! An update interval is a simple delay optionally followed by flexible
//! intervals, separated by `;`:
//!
//! ```text
//! 30s;10s/1-5,09:00-18:00;5m/6-7,00:00-24:00
//! ```
//!
//! Durations accept the `s`, `m`, `h`, `d` and `w` suffixes and may not
//! exceed one day. A flexible interval replaces the simple delay while the
//! current local time falls into its period.
//!
//! Checks are spread over the interval using the item id as a seed, so items
//! sharing one delay do not all fire in the same second.

mod delay;
mod error;
mod period;

pub use delay::{Delay, FlexibleInterval, MAX_DELAY_SECS, next_check_unsupported, parse_duration};
pub use error::DelayError;
pub use period::Period;
