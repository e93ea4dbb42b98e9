//! Group combinators
//!
//! A group is a resolver composed of N child resolvers. The variants differ
//! in how they choose among the children and how they react to failures:
//! rotation, fail-over with or without fall-back, racing all children, or
//! latency-probing the returned addresses.

pub mod fail_back;
pub mod fail_rotate;
pub mod fastest;
pub mod fastest_tcp;
pub mod panel_rotate;
pub mod random;
pub mod round_robin;

pub use fail_back::FailBack;
pub use fail_rotate::{FailRotate, FailRotateOptions};
pub use fastest::Fastest;
pub use fastest_tcp::{FastestTcp, FastestTcpOptions};
pub use panel_rotate::PanelRotate;
pub use random::RandomGroup;
pub use round_robin::RoundRobin;
