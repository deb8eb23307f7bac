use {
    crate::video::{
        Fourcc, Modifier,
        dmabuf::{DmaBuf, DmaBufIds},
    },
    std::{error::Error, rc::Rc},
    thiserror::Error,
};

#[derive(Debug, Error)]
#[error(transparent)]
pub struct AllocatorError(#[from] pub Box<dyn Error>);

/// The renderer side of buffer allocation.
///
/// The display session asks the allocator for scanout buffers and only ever
/// looks at their memory layout.
pub trait Allocator {
    fn create_bo(
        &self,
        dma_buf_ids: &DmaBufIds,
        width: i32,
        height: i32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Rc<dyn BufferObject>, AllocatorError>;
}

pub trait BufferObject {
    fn dmabuf(&self) -> &DmaBuf;
    fn map_write(self: Rc<Self>) -> Result<Box<dyn MappedBuffer>, AllocatorError>;
}

pub trait MappedBuffer {
    fn data_mut(&mut self) -> &mut [u8];
    fn stride(&self) -> i32;
}
