pub mod backoff;
pub mod cache;
pub mod engine;
pub mod jobs;
pub mod record;
pub mod store;
pub mod transfer;
pub mod trigger;
