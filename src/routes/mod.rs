//! Route assembly for the WX Gateway

pub mod gateway;
pub mod health;

pub use gateway::{build_app, create_router};
