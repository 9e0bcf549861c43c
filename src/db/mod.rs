//! Database module for sensorfleet.
//!
//! Device records, their lifecycle, and SQLite storage with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
