//! Virtual scrolling for very long lists.
//!
//! [`Controller`] owns the rows and computes the window that has to be
//! rendered for a scroll position, in O(1) for fixed row heights and
//! O(log n) for measured ones. It also drives infinite scroll through a
//! registered load-more callback, with at most one load in flight.

mod config;
mod controller;
mod heights;

pub use config::{ScrollConfig, ScrollConfigError};
pub use controller::{Controller, ScrollDirection, ScrollOutcome, ScrollState, VisibleRange};
