//! Domain model.
//!
//! Pure value types. Nothing here performs I/O.

pub mod classify;
pub mod dead_letter;
pub mod ids;
pub mod job;
pub mod mask;
pub mod order;

pub use classify::{ClassifiedError, Disposition};
pub use dead_letter::{DlqEntry, DlqReason};
pub use ids::{Id, IdMarker, JobId, Lease, LeaseId};
pub use job::{CapturePayload, EmailPayload, JobPayload, JobSource, JobType};
pub use mask::{
    INVALID_EMAIL, mask_email, mask_payload, payload_recipient, sanitize_message, sanitize_message_for,
};
pub use order::{Order, OrderMetadata, OrderPaymentStatus, OrderStatus, RecoveryFlag};
