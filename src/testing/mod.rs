//! Testing utilities and mock implementations
//!
//! Lets the hub run without an upstream broker or real devices: a scriptable
//! upstream transport and a device proxy that records what it was told.

pub mod mocks;

pub use mocks::*;
