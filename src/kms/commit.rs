
use {
    crate::{
        kms::{
            KmsError,
            device::KmsDevice,
            fence::{Fence, FenceKind},
            transaction::AtomicTransaction,
        },
        utils::{errorfmt::ErrorFmt, oserror::OsError},
        video::drm::{
            DrmCrtc, DrmEvent,
            sys::{DRM_MODE_ATOMIC_ALLOW_MODESET, DRM_MODE_ATOMIC_NONBLOCK, DRM_MODE_PAGE_FLIP_EVENT},
        },
    },
    std::time::{Duration, Instant},
    uapi::c,
};

#[derive(Debug)]
pub struct CommitResult {
    pub sequence: u64,
    pub blocking: bool,
    /// Signals once the display stopped reading the buffers this commit
    /// replaced.
    pub out_fence: Option<Fence>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlipInfo {
    pub sequence: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub vblank: u32,
}

/// Submits transactions for one CRTC and tracks the outstanding page flip.
#[derive(Debug)]
pub struct CommitEngine {
    crtc: DrmCrtc,
    in_flight: Option<u64>,
    modeset_done: bool,
    next_sequence: u64,
}

impl CommitEngine {
    pub fn new(crtc: DrmCrtc) -> Self {
        Self {
            crtc,
            in_flight: None,
            modeset_done: false,
            next_sequence: 1,
        }
    }

    pub fn crtc(&self) -> DrmCrtc {
        self.crtc
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The sequence number the next accepted commit will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn modeset_done(&self) -> bool {
        self.modeset_done
    }

    /// Requires the next commit to be a blocking mode-set.
    pub fn force_modeset(&mut self, crtc: DrmCrtc) {
        self.crtc = crtc;
        self.modeset_done = false;
    }

    /// Submits the transaction.
    ///
    /// On success the transaction is cleared. If the kernel rejects it, it is
    /// left as it was and nothing was applied.
    pub fn commit(
        &mut self,
        dev: &dyn KmsDevice,
        tx: &mut AtomicTransaction,
        blocking: bool,
    ) -> Result<CommitResult, KmsError> {
        if self.in_flight.is_some() {
            return Err(KmsError::CommitBusy);
        }
        if !blocking && !self.modeset_done {
            return Err(KmsError::ModesetRequired);
        }
        let sequence = self.next_sequence;
        let flags = match blocking {
            true => DRM_MODE_ATOMIC_ALLOW_MODESET,
            false => DRM_MODE_ATOMIC_NONBLOCK | DRM_MODE_PAGE_FLIP_EVENT,
        };
        let req = tx.flatten(true, sequence);
        let expect_flip = !blocking && !req.is_empty();
        let out_fence = match dev.atomic_commit(&req, tx.flags() | flags) {
            Ok(sf) => sf,
            Err(e) => {
                log::error!("Atomic commit {} was rejected: {}", sequence, ErrorFmt(&e));
                return Err(KmsError::AtomicCommitRejected(
                    e.os_error().unwrap_or(OsError(c::EIO)),
                ));
            }
        };
        self.next_sequence += 1;
        tx.clear();
        if blocking {
            if !self.modeset_done {
                log::info!("Mode-set on CRTC {} applied", self.crtc);
            }
            self.modeset_done = true;
        }
        if expect_flip {
            self.in_flight = Some(sequence);
        }
        log::debug!(
            "Commit {} on CRTC {} accepted ({})",
            sequence,
            self.crtc,
            if blocking { "blocking" } else { "page flip" },
        );
        Ok(CommitResult {
            sequence,
            blocking,
            out_fence: out_fence.map(|sf| Fence::new(FenceKind::KmsOut, sf)),
        })
    }

    /// Processes an event read from the device.
    ///
    /// Returns the completed flip if the event belongs to this engine.
    pub fn handle_event(&mut self, event: DrmEvent) -> Option<FlipInfo> {
        match event {
            DrmEvent::FlipComplete {
                tv_sec,
                tv_usec,
                sequence,
                crtc_id,
                user_data,
            } => {
                if crtc_id != self.crtc {
                    log::debug!("Dropping flip event for foreign CRTC {}", crtc_id);
                    return None;
                }
                let Some(pending) = self.in_flight else {
                    log::debug!("Dropping unexpected flip event {}", user_data);
                    return None;
                };
                if user_data != pending {
                    log::warn!(
                        "Flip event for commit {} while waiting for commit {}",
                        user_data,
                        pending
                    );
                }
                self.in_flight = None;
                Some(FlipInfo {
                    sequence: pending,
                    tv_sec,
                    tv_usec,
                    vblank: sequence,
                })
            }
        }
    }

    /// Blocks until the outstanding page flip completed.
    ///
    /// Returns `None` if no flip was outstanding.
    pub fn wait_pending(
        &mut self,
        dev: &dyn KmsDevice,
        timeout: Option<Duration>,
    ) -> Result<Option<FlipInfo>, KmsError> {
        if self.in_flight.is_none() {
            return Ok(None);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let event = match dev.next_event(left) {
                Ok(Some(e)) => e,
                Ok(None) => return Err(KmsError::FlipTimedOut),
                Err(e) => return Err(KmsError::Device(e)),
            };
            if let Some(flip) = self.handle_event(event) {
                return Ok(Some(flip));
            }
            if left == Some(Duration::ZERO) {
                return Err(KmsError::FlipTimedOut);
            }
        }
    }

    /// Forgets the outstanding flip. Only used on teardown after a timeout.
    pub fn abandon_pending(&mut self) {
        if let Some(seq) = self.in_flight.take() {
            log::warn!("Abandoning page flip of commit {}", seq);
        }
    }
}
