pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod refresh;

pub use coordinator::RefreshCoordinator;
pub use error::{Error, Result};
