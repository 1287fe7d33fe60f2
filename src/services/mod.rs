//! Persistence collaborators
//!
//! This module contains the paste record collection and the upload
//! directory view the background reaper works against.

pub mod database;
pub mod storage;

// Re-export main types
pub use database::{PasteDb, PasteRecord, ReferenceGuard};
pub use storage::{ensure_upload_dir, ImageCollection, ResourceCollection};
