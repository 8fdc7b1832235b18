//! Domain model (IDs, messages, jobs, errors).

pub mod errors;
pub mod ids;
pub mod job;
pub mod message;

pub use errors::{CourierError, JobError};
pub use ids::{JobId, MessageId, ParseIdError, UserId};
pub use job::{Job, JobDecodeError, JobEnvelope, JobKind, MessageRef};
pub use message::{
    CreateMessage, Field, ListQuery, Message, MessagePatch, MessageStatus, NewMessage, Receipt,
};
