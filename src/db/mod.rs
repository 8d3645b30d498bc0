//! Database module for Vantage.
//!
//! Provides the SQLite record store for websites, ticks and validator
//! identities.

mod models;
mod store;

pub use models::*;
pub use store::*;
