
use {
    crate::{
        kms::{KmsError, device::KmsDevice},
        utils::errorfmt::ErrorFmt,
        video::{
            Fourcc, Modifier,
            dmabuf::{DmaBuf, DmaBufId},
            drm::DrmFb,
        },
    },
    ahash::AHashMap,
    std::{
        fmt::{Debug, Formatter},
        rc::Rc,
    },
    uapi::c,
};

/// A kernel framebuffer bound to the layout of one buffer object.
///
/// The kernel id is removed when the last reference is dropped. Commits that
/// reference the framebuffer hold a reference until the display has moved on.
pub struct Framebuffer {
    dev: Rc<dyn KmsDevice>,
    fb: DrmFb,
    buffer: DmaBufId,
    format: Fourcc,
    modifier: Modifier,
}

impl Debug for Framebuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("fb", &self.fb)
            .field("buffer", &self.buffer)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    pub fn id(&self) -> DrmFb {
        self.fb
    }

    pub fn buffer(&self) -> DmaBufId {
        self.buffer
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Err(e) = self.dev.rm_fb(self.fb) {
            log::error!("Could not delete framebuffer: {}", ErrorFmt(e));
        }
    }
}

/// Imports buffer objects as framebuffers, at most once per buffer object.
pub struct FramebufferRegistrar {
    dev: Rc<dyn KmsDevice>,
    fbs: AHashMap<DmaBufId, Rc<Framebuffer>>,
}

impl FramebufferRegistrar {
    pub fn new(dev: &Rc<dyn KmsDevice>) -> Self {
        Self {
            dev: dev.clone(),
            fbs: Default::default(),
        }
    }

    pub fn register(&mut self, dmabuf: &DmaBuf) -> Result<Rc<Framebuffer>, KmsError> {
        if let Some(fb) = self.fbs.get(&dmabuf.id) {
            return Ok(fb.clone());
        }
        let fb = match self.dev.add_fb(dmabuf) {
            Ok(fb) => fb,
            Err(e) => {
                let layout_error = e
                    .os_error()
                    .is_some_and(|e| e.is_one_of(&[c::EINVAL, c::EOPNOTSUPP, c::ERANGE]));
                if !layout_error {
                    log::error!(
                        "Could not import buffer {}: {}",
                        dmabuf.id,
                        ErrorFmt(&e)
                    );
                }
                return Err(KmsError::ImportRejected {
                    format: dmabuf.format,
                    modifier: dmabuf.modifier,
                    source: e,
                });
            }
        };
        log::debug!("Imported buffer {} as framebuffer {}", dmabuf.id, fb);
        let fb = Rc::new(Framebuffer {
            dev: self.dev.clone(),
            fb,
            buffer: dmabuf.id,
            format: dmabuf.format,
            modifier: dmabuf.modifier,
        });
        self.fbs.insert(dmabuf.id, fb.clone());
        Ok(fb)
    }

    /// Drops the registrar's reference.
    ///
    /// The kernel object lives until the last `Rc` is gone, so callers keep
    /// one while a pending commit references the framebuffer. Registering the
    /// buffer again imports it anew.
    pub fn release(&mut self, fb: &Framebuffer) {
        self.forget(fb.buffer);
    }

    /// Called when a buffer object is destroyed.
    pub fn forget(&mut self, buffer: DmaBufId) {
        self.fbs.remove(&buffer);
    }

    pub fn get(&self, buffer: DmaBufId) -> Option<&Rc<Framebuffer>> {
        self.fbs.get(&buffer)
    }

    pub fn len(&self) -> usize {
        self.fbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fbs.is_empty()
    }

    pub fn clear(&mut self) {
        self.fbs.clear();
    }
}
