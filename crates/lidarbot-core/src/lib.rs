//! lidarbot core: range frames, the newest-wins scan buffer, acquisition,
//! feature normalization, steering policies, cooldown and the control loop.

pub mod domain;
pub mod buffer;
pub mod sensor;
pub mod shutdown;
pub mod validation;
pub mod acquisition;
pub mod normalize;
pub mod model;
pub mod policy;
pub mod cooldown;
pub mod actuator;
pub mod recorder;
pub mod control;
pub mod capture;
pub mod config;

pub use domain::*;
pub use buffer::*;
pub use sensor::*;
pub use shutdown::*;
pub use validation::*;
pub use acquisition::*;
pub use normalize::*;
pub use model::*;
pub use policy::*;
pub use cooldown::*;
pub use actuator::*;
pub use recorder::*;
pub use control::*;
pub use capture::*;
// `self::` keeps this apart from the `config` crate
pub use self::config::*;

#[cfg(test)]
mod tests_session;
#[cfg(test)]
mod tests_config;
