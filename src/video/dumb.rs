
use {
    crate::{
        allocator::{Allocator, AllocatorError, BufferObject, MappedBuffer},
        utils::{
            errorfmt::ErrorFmt,
            mmap::{Mmapped, mmap},
            oserror::OsError,
        },
        video::{
            Fourcc, INVALID_MODIFIER, LINEAR_MODIFIER, Modifier,
            dmabuf::{DmaBuf, DmaBufId, DmaBufIds, DmaBufPlane, PlaneVec},
            drm::{
                DrmError, DrmMaster,
                sys::{
                    DRM_CLOEXEC, DRM_RDWR, mode_create_dumb, mode_destroy_dumb, mode_map_dumb,
                    prime_handle_to_fd,
                },
            },
        },
    },
    std::{cell::RefCell, rc::Rc},
    thiserror::Error,
    uapi::OwnedFd,
};

#[derive(Debug, Error)]
pub enum DumbError {
    #[error("Format {0} cannot be allocated as a dumb buffer")]
    UnsupportedFormat(Fourcc),
    #[error("Dumb buffers are always linear but modifier {0:#x} was requested")]
    UnsupportedModifier(Modifier),
    #[error(transparent)]
    Drm(#[from] DrmError),
    #[error("Could not mmap a dumb buffer")]
    Mmap(#[source] OsError),
    #[error("Dumb buffer {0} is already mapped")]
    AlreadyMapped(DmaBufId),
}

impl From<DumbError> for AllocatorError {
    fn from(e: DumbError) -> Self {
        Self(Box::new(e))
    }
}

/// Allocates CPU-mapped, linear buffers through the dumb-buffer interface.
pub struct DumbAllocator {
    drm: Rc<DrmMaster>,
}

impl DumbAllocator {
    pub fn new(drm: &Rc<DrmMaster>) -> Self {
        Self { drm: drm.clone() }
    }

    fn map_and_export(&self, handle: u32, size: u64) -> Result<(Mmapped, OwnedFd), DumbError> {
        let offset = mode_map_dumb(self.drm.raw(), handle).map_err(DrmError::MapDumb)?;
        let map = mmap(self.drm.raw(), size as usize, offset as _).map_err(DumbError::Mmap)?;
        let fd = prime_handle_to_fd(self.drm.raw(), handle, DRM_CLOEXEC | DRM_RDWR)
            .map_err(DrmError::ExportDumb)?;
        Ok((map, fd))
    }

    fn create(
        &self,
        dma_buf_ids: &DmaBufIds,
        width: i32,
        height: i32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Rc<DumbBo>, DumbError> {
        let Some(bpp) = format.bpp() else {
            return Err(DumbError::UnsupportedFormat(format));
        };
        if modifier != LINEAR_MODIFIER && modifier != INVALID_MODIFIER {
            return Err(DumbError::UnsupportedModifier(modifier));
        }
        let dumb = mode_create_dumb(self.drm.raw(), width as _, height as _, bpp)
            .map_err(DrmError::CreateDumb)?;
        // The mapping and the exported fd keep the memory alive. Closing the
        // handle here lets framebuffer import hold its own handle.
        let res = self.map_and_export(dumb.handle, dumb.size);
        if let Err(e) = mode_destroy_dumb(self.drm.raw(), dumb.handle) {
            log::warn!("Could not destroy dumb buffer handle: {}", ErrorFmt(e));
        }
        let (map, fd) = res?;
        let mut planes = PlaneVec::new();
        planes.push(DmaBufPlane {
            offset: 0,
            stride: dumb.pitch,
            fd: Rc::new(fd),
        });
        let dmabuf = DmaBuf {
            id: dma_buf_ids.next(),
            width,
            height,
            format,
            modifier: LINEAR_MODIFIER,
            planes,
        };
        log::debug!(
            "Allocated dumb buffer {} ({}x{}, {}, stride {})",
            dmabuf.id,
            width,
            height,
            format,
            dumb.pitch,
        );
        Ok(Rc::new(DumbBo {
            dmabuf,
            map: RefCell::new(Some(map)),
        }))
    }
}

impl Allocator for DumbAllocator {
    fn create_bo(
        &self,
        dma_buf_ids: &DmaBufIds,
        width: i32,
        height: i32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Rc<dyn BufferObject>, AllocatorError> {
        Ok(self.create(dma_buf_ids, width, height, format, modifier)?)
    }
}

pub struct DumbBo {
    dmabuf: DmaBuf,
    /// Lent to the live `DumbMapping`, if any.
    map: RefCell<Option<Mmapped>>,
}

impl BufferObject for DumbBo {
    fn dmabuf(&self) -> &DmaBuf {
        &self.dmabuf
    }

    fn map_write(self: Rc<Self>) -> Result<Box<dyn MappedBuffer>, AllocatorError> {
        let Some(map) = self.map.borrow_mut().take() else {
            return Err(DumbError::AlreadyMapped(self.dmabuf.id).into());
        };
        Ok(Box::new(DumbMapping {
            bo: self,
            map: Some(map),
        }))
    }
}

struct DumbMapping {
    bo: Rc<DumbBo>,
    map: Option<Mmapped>,
}

impl MappedBuffer for DumbMapping {
    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.map {
            Some(map) => map.data_mut(),
            None => &mut [],
        }
    }

    fn stride(&self) -> i32 {
        self.bo.dmabuf.planes[0].stride as i32
    }
}

impl Drop for DumbMapping {
    fn drop(&mut self) {
        *self.bo.map.borrow_mut() = self.map.take();
    }
}
