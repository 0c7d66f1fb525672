mod config;
mod error;
mod types;
mod version;

pub mod helpers;
pub mod schedule;
pub mod tls;

pub use config::*;
pub use error::OpsgateError;
pub use types::*;
pub use version::*;
