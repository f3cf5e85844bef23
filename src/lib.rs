//! Temporary file transfer relay.
//!
//! Files are uploaded once, downloaded through an expiring link, and
//! reclaimed by a background reaper once they expire or are abandoned.

pub mod backends;
pub mod clock;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;
