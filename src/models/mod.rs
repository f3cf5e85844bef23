//! Core data models for the transfer relay.
//!
//! A transfer is tracked as a metadata row (`TransferRecord`) that maps
//! cleanly to the `transfers` table via `sqlx::FromRow` and serializes as
//! JSON via `serde`. Payload bytes never appear here.

pub mod page;
pub mod transfer;
