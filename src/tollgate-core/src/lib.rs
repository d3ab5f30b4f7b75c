pub mod core;
pub mod models;

pub use crate::core::*;
pub use crate::models::*;

pub use tollgate_errors::{GatewayError, GatewayResult};
