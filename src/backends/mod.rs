//! Storage backends behind the two narrow seams the core consumes:
//! [`object_store::ObjectStore`] for payload bytes and
//! [`metadata_store::MetadataStore`] for transfer records.

pub mod memory;
pub mod metadata_store;
pub mod object_store;
