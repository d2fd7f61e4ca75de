//! Testing utilities and mock implementations
//!
//! Lets sessions be exercised end to end without a network or a broker.

pub mod mocks;

pub use mocks::*;
