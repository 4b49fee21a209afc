//! Data types for the WX Gateway

mod types;

pub use types::*;
