//! Durable training log for labelled range frames, plus replay of what was recorded.

pub mod error;
pub mod replay;
pub mod store;

pub use self::error::*;
pub use self::replay::*;
pub use self::store::*;
