//! The atomic display-commit and buffer hand-off engine.
//!
//! Everything in here runs on the thread that owns the display. The kernel is
//! reached exclusively through [`device::KmsDevice`].

pub mod commit;
pub mod device;
pub mod fence;
pub mod framebuffer;
pub mod resource;
pub mod session;
#[cfg(test)]
pub mod test_device;
pub mod transaction;

use {
    crate::{
        allocator::AllocatorError,
        kms::resource::PlaneType,
        utils::oserror::OsError,
        video::{Fourcc, Modifier, dmabuf::DmaBufId, drm::DrmError},
    },
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("Object {0} no longer exists")]
    ResourceUnavailable(u32),
    #[error("Could not read the property table of object {id}")]
    PropertyQueryFailed {
        id: u32,
        #[source]
        source: PropertyError,
    },
    #[error("The display rejected a {format} buffer with modifier {modifier:#x}")]
    ImportRejected {
        format: Fourcc,
        modifier: Modifier,
        #[source]
        source: DrmError,
    },
    #[error("A page flip is still pending")]
    CommitBusy,
    #[error("The kernel rejected the atomic commit")]
    AtomicCommitRejected(#[source] OsError),
    #[error("Could not wait for a fence")]
    FenceError(#[source] OsError),
    #[error("A fence did not signal in time")]
    FenceTimedOut,
    #[error("The display must be mode-set with a blocking commit first")]
    ModesetRequired,
    #[error("No buffer is available for rendering")]
    NoFreeBuffer,
    #[error("Buffer {0} was not handed out as a render target")]
    NotRenderTarget(DmaBufId),
    #[error("The page flip did not complete in time")]
    FlipTimedOut,
    #[error("No connected connector matches the configuration")]
    NoConnector,
    #[error("Connector {0} has no usable CRTC")]
    NoCrtc(String),
    #[error("CRTC {0} has no usable {1} plane")]
    NoPlane(u32, PlaneType),
    #[error("Connector {0} has no matching mode")]
    NoMode(String),
    #[error("The display session has been torn down")]
    SessionDestroyed,
    #[error("Could not allocate a buffer")]
    Allocator(#[from] AllocatorError),
    #[error("A device operation failed")]
    Device(#[source] DrmError),
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error(transparent)]
    Drm(#[from] DrmError),
    #[error("The required property {0} is missing")]
    Missing(&'static str),
    #[error("Property {0} has an unexpected type")]
    InvalidType(&'static str),
}
