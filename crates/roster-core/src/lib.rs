//! Core types for the Roster student-record service.
//!
//! This crate provides the pieces every other Roster crate builds on:
//! - [`StudentId`] and [`StudentRecord`], the subject of every mutation
//! - Attribute validation against the item limits of the backing store
//! - [`Page`] and [`PageRequest`] for token-based pagination
//! - The [`RecordStore`] trait with an in-memory, version-checked implementation
//!
//! # Example
//!
//! ```rust
//! use roster_core::{InMemoryRecordStore, RecordStore, StudentId, StudentRecord};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemoryRecordStore::new();
//! let attributes = json!({ "name": "Asha" }).as_object().cloned().unwrap();
//! let record = StudentRecord::new(StudentId::generate(), attributes);
//!
//! let stored = store.insert(record).await.unwrap();
//! assert_eq!(stored.version, 1);
//! # });
//! ```

pub mod error;
pub mod page;
pub mod store;
pub mod student;
pub mod validation;


pub use error::{StoreError, StoreResult};
pub use page::{Page, PageRequest, PageToken, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use store::{InMemoryRecordStore, RecordStore};
pub use student::{AttributeLimits, Attributes, StudentId, StudentRecord};
pub use validation::{Validate, ValidationError, ValidationErrorKind, ValidationErrors};
