//! Downstream sessions as seen by transport adapters

pub mod listener;

pub use listener::{DeviceListener, Disposition};
