//! Middleware module for the WX Gateway
//!
//! Contains the webhook signature middleware.

mod signature;

pub use signature::{query_params, verify_signature};
