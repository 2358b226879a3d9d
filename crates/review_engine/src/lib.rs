//! Application review and enrollment lifecycle engine.
//!
//! Every operation takes a [`ReviewContext`] and resolves to a typed value or a
//! [`ReviewError`]; nothing here panics on caller input.

use std::sync::Arc;

use storage::{BlobStore, Storage};

pub mod capacity;
pub mod catalog;
pub mod checklist;
pub mod enrollment;
mod error;
pub mod messaging;
mod upload;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use capacity::{
    available_slots, capacity, subscribe_capacity, subscribe_enrollments, CapacityPolicy,
    CapacitySubscription, EnrollmentListSubscription,
};
pub use catalog::{
    create_program, delete_program, get_program, list_programs, update_program, validate_program,
};
pub use checklist::{
    checklist, document_content, document_prefix, set_checklist_item, toggle_checklist_item,
    upload_document, Checklist,
};
pub use enrollment::{
    approve, enrollment_detail, list_enrollments, reject, save_remarks, submit_application,
};
pub use error::ReviewError;
pub use messaging::{
    attachment_content, inbox, open_message, reply_target, send_message, sent_messages,
    unread_count, OutgoingAttachment, OutgoingMessage,
};
pub use upload::{DEFAULT_MAX_ATTACHMENT_BYTES, MAX_FILENAME_BYTES};

/// Tunables that change engine behaviour rather than wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewPolicy {
    pub capacity: CapacityPolicy,
    pub max_attachment_bytes: usize,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            capacity: CapacityPolicy::CountAll,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

#[derive(Clone)]
pub struct ReviewContext {
    pub storage: Storage,
    pub blobs: Arc<dyn BlobStore>,
    pub policy: ReviewPolicy,
}

impl ReviewContext {
    /// Context whose blobs live in the same SQLite store as the records.
    pub fn new(storage: Storage) -> Self {
        let blobs: Arc<dyn BlobStore> = Arc::new(storage.clone());
        Self {
            storage,
            blobs,
            policy: ReviewPolicy::default(),
        }
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_policy(mut self, policy: ReviewPolicy) -> Self {
        self.policy = policy;
        self
    }
}
