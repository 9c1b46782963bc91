pub mod client;
pub mod types;

pub use client::{PowerBiClient, RefreshService, DEFAULT_API_BASE_URL};
pub use types::{
    DatasetTarget, RefreshObjectRef, RefreshOutcome, RefreshRecord, RefreshRequest, RefreshStatus,
};
