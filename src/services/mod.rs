pub mod error;
pub mod lifecycle;
pub mod policy;
pub mod query;
pub mod reaper;
pub mod relay;
pub mod retry;
