use crate::core::model::{Gid, Uid};

/// Broadcast to observers (the CLI status UI); never load-bearing for the
/// lifecycle itself, so sends are fire-and-forget.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    JobAdded { gid: Gid, uid: Uid, name: String },
    MetadataResolving { gid: Gid },
    PolicyRejected { gid: Gid, reason: String },
    SelectionPending { gid: Gid },
    JobCompleted { gid: Gid, name: String },
    SeedingStarted { gid: Gid, name: String },
    JobError { gid: Gid, message: String },
    JobRemoved { gid: Gid },
}
