//! Testing utilities and mock implementations
//!
//! Mocks for exercising the connection pool and service without a broker
//! or the surrounding persistence and identity systems.

pub mod mocks;

pub use mocks::*;
