//! Common types shared across raidstore modules.
//!
//! This crate holds the record model, the RAiD document types carried as
//! record payloads, and the error taxonomy every storage backend reports.

pub mod document;
pub mod error;
pub mod types;

pub use document::RaidDocument;
pub use error::{Error, ErrorKind, Result};
pub use types::{
    IdentifierRecord, IssuingPoint, NewRecord, RecordFilter, RecordKey, DEFAULT_NAMESPACE,
    HANDLE_BASE, ISSUING_POINT_ID_FLOOR, OPEN_ACCESS_TYPE,
};
