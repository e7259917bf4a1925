//! Domain layer: change sets, event processors and error types.

pub mod change_set;
pub mod errors;
pub mod processors;

pub use change_set::{
    AttachmentRecord, ChangeOp, ChangeRecord, ChangeSet, DemandCommentRecord, DemandRecord,
    Match2CommentRecord, Match2Record,
};
pub use errors::{ChainError, StoreError, SubmissionError, SyncError};
pub use processors::{EventProcessor, ProcessName, ResolvedInput, SUPPORTED_VERSION};
