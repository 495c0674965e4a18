//! Manifest reconciliation.

pub mod delta;

pub use delta::{diff, Delta};
