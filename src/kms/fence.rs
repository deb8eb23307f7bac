//! Explicit synchronization between the renderer and the display.
//!
//! All fences are sync files: they become readable once signaled.


use {
    crate::{
        kms::{
            KmsError,
            resource::{CrtcResource, PlaneResource},
            transaction::AtomicTransaction,
        },
        utils::{errorfmt::ErrorFmt, oserror::OsError, timeout::poll_timeout},
    },
    std::{
        fmt::{Debug, Display, Formatter},
        ops::Deref,
        rc::Rc,
        slice,
        time::{Duration, Instant},
    },
    uapi::{Errno, OwnedFd, c},
};

#[derive(Clone)]
pub struct SyncFile(pub Rc<OwnedFd>);

impl Deref for SyncFile {
    type Target = Rc<OwnedFd>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Debug for SyncFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyncFile({})", self.0.raw())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FenceKind {
    /// Rendering into a buffer has completed.
    Gpu,
    /// Handed to the kernel with a commit so that scanout waits for it.
    KmsIn,
    /// The display controller has stopped reading the previous buffer.
    KmsOut,
}

impl Display for FenceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FenceKind::Gpu => "gpu",
            FenceKind::KmsIn => "kms in",
            FenceKind::KmsOut => "kms out",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
enum FenceState {
    Unsignaled(SyncFile),
    Signaled,
    Closed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// A single-use fence.
///
/// The sync file is closed as soon as the fence is observed signaled. A fence
/// that was closed without being observed can no longer be waited on.
#[derive(Debug)]
pub struct Fence {
    kind: FenceKind,
    state: FenceState,
}

impl Fence {
    pub fn new(kind: FenceKind, sync_file: SyncFile) -> Self {
        Self {
            kind,
            state: FenceState::Unsignaled(sync_file),
        }
    }

    pub fn signaled(kind: FenceKind) -> Self {
        Self {
            kind,
            state: FenceState::Signaled,
        }
    }

    pub fn kind(&self) -> FenceKind {
        self.kind
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self.state, FenceState::Signaled)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, FenceState::Closed)
    }

    pub fn sync_file(&self) -> Option<&SyncFile> {
        match &self.state {
            FenceState::Unsignaled(sf) => Some(sf),
            _ => None,
        }
    }

    /// Returns whether the fence has signaled without blocking.
    pub fn poll(&mut self) -> Result<bool, KmsError> {
        let status = self.wait(Some(Duration::ZERO))?;
        Ok(status == FenceStatus::Signaled)
    }

    /// Waits for the fence to signal.
    ///
    /// `None` waits forever. A timeout leaves the fence unsignaled and open.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<FenceStatus, KmsError> {
        let sf = match &self.state {
            FenceState::Signaled => return Ok(FenceStatus::Signaled),
            FenceState::Closed => return Err(KmsError::FenceError(OsError(c::EBADF))),
            FenceState::Unsignaled(sf) => sf,
        };
        if wait_readable(sf.raw(), timeout)? {
            self.state = FenceState::Signaled;
            Ok(FenceStatus::Signaled)
        } else {
            Ok(FenceStatus::TimedOut)
        }
    }

    /// Drops the sync file without observing it.
    pub fn close(&mut self) {
        self.state = FenceState::Closed;
    }

    /// Consumes the fence to hand its sync file to the kernel.
    ///
    /// Returns `None` if it has already signaled.
    fn into_sync_file(self) -> Result<Option<SyncFile>, KmsError> {
        match self.state {
            FenceState::Unsignaled(sf) => Ok(Some(sf)),
            FenceState::Signaled => Ok(None),
            FenceState::Closed => Err(KmsError::FenceError(OsError(c::EBADF))),
        }
    }
}

fn wait_readable(fd: c::c_int, timeout: Option<Duration>) -> Result<bool, KmsError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut pollfd = c::pollfd {
        fd,
        events: c::POLLIN,
        revents: 0,
    };
    loop {
        let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let timeout = poll_timeout(left);
        match uapi::poll(slice::from_mut(&mut pollfd), timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                if pollfd.revents & (c::POLLERR | c::POLLNVAL) != 0 {
                    return Err(KmsError::FenceError(OsError(c::EIO)));
                }
                return Ok(true);
            }
            Err(Errno(c::EINTR)) => continue,
            Err(e) => return Err(KmsError::FenceError(e.into())),
        }
    }
}

/// Asks the kernel to attach an out-fence to the next commit on `crtc`.
///
/// The fence is returned with the commit result. Returns `false` if the CRTC
/// has no `OUT_FENCE_PTR` property.
pub fn create_out_fence(tx: &mut AtomicTransaction, crtc: &CrtcResource) -> bool {
    match crtc.props.out_fence_ptr {
        Some(prop) => {
            tx.request_out_fence(crtc.id, prop);
            true
        }
        None => false,
    }
}

/// Makes the display wait for `gpu` before scanning out the plane's buffer.
///
/// Planes without `IN_FENCE_FD` fall back to waiting on the CPU, bounded by
/// `cpu_timeout`.
pub fn attach_in_fence(
    tx: &mut AtomicTransaction,
    plane: &PlaneResource,
    mut gpu: Fence,
    cpu_timeout: Duration,
) -> Result<(), KmsError> {
    match plane.props.in_fence_fd {
        Some(prop) => {
            if let Some(sf) = gpu.into_sync_file()? {
                tx.set_in_fence(plane.id, prop, sf);
            }
            Ok(())
        }
        None => {
            if gpu.is_signaled() {
                return Ok(());
            }
            log::warn!(
                "Plane {} does not support in-fences, waiting for the {} fence on the CPU",
                plane.id,
                gpu.kind()
            );
            match gpu.wait(Some(cpu_timeout)) {
                Ok(FenceStatus::Signaled) => Ok(()),
                Ok(FenceStatus::TimedOut) => Err(KmsError::FenceTimedOut),
                Err(e) => {
                    log::error!("Could not wait for the {} fence: {}", gpu.kind(), ErrorFmt(&e));
                    Err(e)
                }
            }
        }
    }
}
