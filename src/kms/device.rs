use {
    crate::{
        kms::fence::SyncFile,
        utils::errorfmt::ErrorFmt,
        video::{
            dmabuf::DmaBuf,
            drm::{
                DrmBlob, DrmCardResources, DrmConnector, DrmConnectorInfo, DrmEncoder,
                DrmEncoderInfo, DrmError, DrmEvent, DrmFb, DrmMaster, DrmModeInfo, DrmPlane,
                DrmPlaneInfo, DrmProperty, DrmPropertyDefinition, DrmPropertyValue,
            },
        },
    },
    std::{
        fmt::{Debug, Formatter},
        rc::Rc,
        time::Duration,
    },
};

/// A flattened atomic request in the layout of the atomic ioctl.
#[derive(Debug, Default, Clone)]
pub struct AtomicRequest {
    pub objects: Vec<u32>,
    pub object_lengths: Vec<u32>,
    pub props: Vec<u32>,
    pub values: Vec<u64>,
    /// Index into `values` of an `OUT_FENCE_PTR` entry. The device replaces the
    /// value by a pointer to a slot the kernel writes the sync file into.
    pub out_fence: Option<usize>,
    pub user_data: u64,
}

impl AtomicRequest {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterates over `(object, [(property, value)])`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, Vec<(u32, u64)>)> + '_ {
        let mut pos = 0;
        self.objects
            .iter()
            .zip(self.object_lengths.iter())
            .map(move |(&obj, &len)| {
                let start = pos;
                pos += len as usize;
                let props = self.props[start..pos]
                    .iter()
                    .copied()
                    .zip(self.values[start..pos].iter().copied())
                    .collect();
                (obj, props)
            })
    }
}

/// Every kernel call the display core makes.
pub trait KmsDevice {
    fn get_object_properties(&self, id: u32, ty: u32)
    -> Result<Vec<DrmPropertyValue>, DrmError>;
    fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError>;
    fn get_resources(&self) -> Result<DrmCardResources, DrmError>;
    fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError>;
    fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError>;
    fn get_connector_info(&self, connector: DrmConnector) -> Result<DrmConnectorInfo, DrmError>;
    fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError>;
    fn add_fb(&self, dmabuf: &DmaBuf) -> Result<DrmFb, DrmError>;
    fn rm_fb(&self, fb: DrmFb) -> Result<(), DrmError>;
    fn create_mode_blob(&self, mode: &DrmModeInfo) -> Result<DrmBlob, DrmError>;
    fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError>;
    fn atomic_commit(&self, req: &AtomicRequest, flags: u32)
    -> Result<Option<SyncFile>, DrmError>;
    fn next_event(&self, timeout: Option<Duration>) -> Result<Option<DrmEvent>, DrmError>;
}

impl KmsDevice for DrmMaster {
    fn get_object_properties(
        &self,
        id: u32,
        ty: u32,
    ) -> Result<Vec<DrmPropertyValue>, DrmError> {
        self.get_properties(id, ty)
    }

    fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError> {
        DrmMaster::get_property(self, prop)
    }

    fn get_resources(&self) -> Result<DrmCardResources, DrmError> {
        DrmMaster::get_resources(self)
    }

    fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError> {
        DrmMaster::get_planes(self)
    }

    fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError> {
        DrmMaster::get_plane_info(self, plane)
    }

    fn get_connector_info(&self, connector: DrmConnector) -> Result<DrmConnectorInfo, DrmError> {
        DrmMaster::get_connector_info(self, connector, true)
    }

    fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError> {
        DrmMaster::get_encoder_info(self, encoder)
    }

    fn add_fb(&self, dmabuf: &DmaBuf) -> Result<DrmFb, DrmError> {
        DrmMaster::add_fb(self, dmabuf)
    }

    fn rm_fb(&self, fb: DrmFb) -> Result<(), DrmError> {
        DrmMaster::rm_fb(self, fb)
    }

    fn create_mode_blob(&self, mode: &DrmModeInfo) -> Result<DrmBlob, DrmError> {
        self.create_blob(&mode.to_raw())
    }

    fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError> {
        DrmMaster::destroy_blob(self, blob)
    }

    fn atomic_commit(
        &self,
        req: &AtomicRequest,
        flags: u32,
    ) -> Result<Option<SyncFile>, DrmError> {
        let fd = self.atomic(
            flags,
            &req.objects,
            &req.object_lengths,
            &req.props,
            &req.values,
            req.out_fence,
            req.user_data,
        )?;
        Ok(fd.map(|fd| SyncFile(Rc::new(fd))))
    }

    fn next_event(&self, timeout: Option<Duration>) -> Result<Option<DrmEvent>, DrmError> {
        self.event(timeout)
    }
}

/// A kernel property blob holding a display mode.
pub struct ModeBlob {
    dev: Rc<dyn KmsDevice>,
    id: DrmBlob,
    mode: DrmModeInfo,
}

impl Debug for ModeBlob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeBlob")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ModeBlob {
    pub fn new(dev: &Rc<dyn KmsDevice>, mode: &DrmModeInfo) -> Result<Self, DrmError> {
        let id = dev.create_mode_blob(mode)?;
        Ok(Self {
            dev: dev.clone(),
            id,
            mode: mode.clone(),
        })
    }

    pub fn id(&self) -> DrmBlob {
        self.id
    }

    pub fn mode(&self) -> &DrmModeInfo {
        &self.mode
    }
}

impl Drop for ModeBlob {
    fn drop(&mut self) {
        if let Err(e) = self.dev.destroy_blob(self.id) {
            log::error!("Could not destroy mode blob: {}", ErrorFmt(e));
        }
    }
}
