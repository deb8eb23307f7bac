//! An in-memory display device for tests.
//!
//! Sync files handed out by this device are eventfds. They become readable
//! once signaled through the device.

use {
    crate::{
        allocator::{Allocator, AllocatorError, BufferObject, MappedBuffer},
        kms::{
            device::{AtomicRequest, KmsDevice},
            fence::{Fence, FenceKind, SyncFile},
        },
        utils::oserror::OsError,
        video::{
            ARGB8888, Fourcc, Modifier, XRGB8888,
            dmabuf::{DmaBuf, DmaBufIds, DmaBufPlane, PlaneVec},
            drm::{
                DrmBlob, DrmCardResources, DrmConnector, DrmConnectorInfo, DrmCrtc, DrmEncoder,
                DrmEncoderInfo, DrmError, DrmEvent, DrmFb, DrmModeInfo, DrmObject, DrmPlane,
                DrmPlaneInfo, DrmProperty, DrmPropertyDefinition, DrmPropertyEnumValue,
                DrmPropertyType, DrmPropertyValue,
                sys::{
                    CONNECTOR_STATUS_CONNECTED, CONNECTOR_STATUS_DISCONNECTED,
                    DRM_MODE_ATOMIC_NONBLOCK, DRM_MODE_ATOMIC_TEST_ONLY,
                    DRM_MODE_CONNECTOR_DisplayPort, DRM_MODE_CONNECTOR_HDMIA,
                    DRM_MODE_PAGE_FLIP_EVENT, DRM_MODE_TYPE_PREFERRED,
                },
            },
        },
    },
    ahash::{AHashMap, AHashSet},
    std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        rc::Rc,
        time::Duration,
    },
    uapi::{OwnedFd, c},
};

pub const CRTC_A: DrmCrtc = DrmCrtc(10);
pub const CRTC_B: DrmCrtc = DrmCrtc(11);
pub const HDMI: DrmConnector = DrmConnector(20);
pub const DP: DrmConnector = DrmConnector(21);
pub const ENCODER_HDMI: DrmEncoder = DrmEncoder(30);
pub const ENCODER_DP: DrmEncoder = DrmEncoder(31);
pub const PRIMARY_A: DrmPlane = DrmPlane(40);
pub const CURSOR_A: DrmPlane = DrmPlane(41);
pub const PRIMARY_B: DrmPlane = DrmPlane(42);
pub const OVERLAY: DrmPlane = DrmPlane(43);

const PLANE_TYPE_OVERLAY: u64 = 0;
const PLANE_TYPE_PRIMARY: u64 = 1;
const PLANE_TYPE_CURSOR: u64 = 2;

#[derive(Copy, Clone, Debug)]
pub struct TestDeviceConfig {
    pub in_fences: bool,
    pub out_fences: bool,
    pub cursor_plane: bool,
}

impl Default for TestDeviceConfig {
    fn default() -> Self {
        Self {
            in_fences: true,
            out_fences: true,
            cursor_plane: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordedCommit {
    pub flags: u32,
    pub objects: Vec<(u32, Vec<(u32, u64)>)>,
    pub out_fence: bool,
    pub user_data: u64,
}

impl RecordedCommit {
    pub fn object(&self, id: u32) -> Option<&[(u32, u64)]> {
        self.objects
            .iter()
            .find(|(o, _)| *o == id)
            .map(|(_, p)| &p[..])
    }

    pub fn value(&self, id: u32, prop: DrmProperty) -> Option<u64> {
        self.object(id)?
            .iter()
            .find(|(p, _)| *p == prop.0)
            .map(|(_, v)| *v)
    }

    pub fn is_test(&self) -> bool {
        self.flags & DRM_MODE_ATOMIC_TEST_ONLY != 0
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags & DRM_MODE_ATOMIC_NONBLOCK != 0
    }
}

struct Object {
    ty: u32,
    props: Vec<DrmPropertyValue>,
}

#[derive(Default)]
pub struct TestDevice {
    props: RefCell<AHashMap<DrmProperty, DrmPropertyDefinition>>,
    prop_ids: RefCell<AHashMap<&'static str, DrmProperty>>,
    objects: RefCell<AHashMap<u32, Object>>,
    crtcs: RefCell<Vec<DrmCrtc>>,
    connectors: RefCell<Vec<DrmConnector>>,
    encoders: RefCell<Vec<DrmEncoder>>,
    planes: RefCell<Vec<DrmPlane>>,
    plane_info: RefCell<AHashMap<DrmPlane, DrmPlaneInfo>>,
    connector_info: RefCell<AHashMap<DrmConnector, DrmConnectorInfo>>,
    encoder_info: RefCell<AHashMap<DrmEncoder, DrmEncoderInfo>>,
    next_id: Cell<u32>,
    live_fbs: RefCell<AHashSet<DrmFb>>,
    removed_fbs: RefCell<Vec<DrmFb>>,
    rejected_modifiers: RefCell<Vec<Modifier>>,
    rejected_formats: RefCell<Vec<Fourcc>>,
    live_blobs: RefCell<AHashSet<DrmBlob>>,
    commits: RefCell<Vec<RecordedCommit>>,
    reject_next_commit: Cell<Option<c::c_int>>,
    property_errno: Cell<Option<c::c_int>>,
    hold_flips: Cell<bool>,
    held: RefCell<VecDeque<DrmEvent>>,
    events: RefCell<VecDeque<DrmEvent>>,
    vblank: Cell<u32>,
    out_fences: RefCell<Vec<Rc<OwnedFd>>>,
}

fn range(min: u64, max: u64) -> DrmPropertyType {
    DrmPropertyType::Range { min, max }
}

fn signed_range(min: i64, max: i64) -> DrmPropertyType {
    DrmPropertyType::SignedRange { min, max }
}

fn object(ty: u32) -> DrmPropertyType {
    DrmPropertyType::Object { ty }
}

pub fn test_mode(width: u16, height: u16, preferred: bool) -> DrmModeInfo {
    let htotal = width + 280;
    let vtotal = height + 45;
    DrmModeInfo {
        clock: (htotal as u32 * vtotal as u32 * 60) / 1000,
        hdisplay: width,
        hsync_start: width + 88,
        hsync_end: width + 132,
        htotal,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 4,
        vsync_end: height + 9,
        vtotal,
        vscan: 0,
        vrefresh: 60,
        flags: 0,
        ty: if preferred { DRM_MODE_TYPE_PREFERRED } else { 0 },
        name: format!("{}x{}", width, height).into(),
    }
}

impl TestDevice {
    /// Two CRTCs. HDMI-A-1 is connected and reachable from CRTC A only.
    /// DP-1 is disconnected.
    pub fn new(config: TestDeviceConfig) -> Rc<Self> {
        let dev = Self::default();
        dev.next_id.set(1000);
        for crtc in [CRTC_A, CRTC_B] {
            let mut props = vec![
                dev.value("ACTIVE", range(0, 1), 0),
                dev.value("MODE_ID", DrmPropertyType::Blob, 0),
            ];
            if config.out_fences {
                props.push(dev.value("OUT_FENCE_PTR", range(0, u64::MAX), 0));
            }
            dev.add_object(crtc, props);
            dev.crtcs.borrow_mut().push(crtc);
        }
        let planes = [
            (PRIMARY_A, PLANE_TYPE_PRIMARY, 0b01),
            (CURSOR_A, PLANE_TYPE_CURSOR, 0b01),
            (PRIMARY_B, PLANE_TYPE_PRIMARY, 0b10),
            (OVERLAY, PLANE_TYPE_OVERLAY, 0b11),
        ];
        for (plane, ty, possible_crtcs) in planes {
            if ty == PLANE_TYPE_CURSOR && !config.cursor_plane {
                continue;
            }
            let mut props = vec![
                dev.value("FB_ID", object(DrmFb::TYPE), 0),
                dev.value("CRTC_ID", object(DrmCrtc::TYPE), 0),
                dev.value("SRC_X", range(0, u32::MAX as u64), 0),
                dev.value("SRC_Y", range(0, u32::MAX as u64), 0),
                dev.value("SRC_W", range(0, u32::MAX as u64), 0),
                dev.value("SRC_H", range(0, u32::MAX as u64), 0),
                dev.value("CRTC_X", signed_range(i32::MIN as i64, i32::MAX as i64), 0),
                dev.value("CRTC_Y", signed_range(i32::MIN as i64, i32::MAX as i64), 0),
                dev.value("CRTC_W", range(0, i32::MAX as u64), 0),
                dev.value("CRTC_H", range(0, i32::MAX as u64), 0),
                dev.value("type", plane_type_enum(), ty),
            ];
            if config.in_fences {
                let ty = signed_range(-1, i32::MAX as i64);
                props.push(dev.value("IN_FENCE_FD", ty, -1i64 as u64));
            }
            dev.add_object(plane, props);
            dev.planes.borrow_mut().push(plane);
            dev.plane_info.borrow_mut().insert(
                plane,
                DrmPlaneInfo {
                    crtc_id: DrmCrtc::NONE,
                    fb_id: DrmFb::NONE,
                    possible_crtcs,
                    format_types: vec![XRGB8888.0, ARGB8888.0],
                },
            );
        }
        let connectors = [
            (
                HDMI,
                ENCODER_HDMI,
                0b01,
                DRM_MODE_CONNECTOR_HDMIA,
                CONNECTOR_STATUS_CONNECTED,
                vec![test_mode(1280, 720, false), test_mode(1920, 1080, true)],
            ),
            (
                DP,
                ENCODER_DP,
                0b11,
                DRM_MODE_CONNECTOR_DisplayPort,
                CONNECTOR_STATUS_DISCONNECTED,
                vec![],
            ),
        ];
        for (connector, encoder, possible_crtcs, ty, connection, modes) in connectors {
            let props = vec![dev.value("CRTC_ID", object(DrmCrtc::TYPE), 0)];
            dev.add_object(connector, props);
            dev.connectors.borrow_mut().push(connector);
            dev.encoders.borrow_mut().push(encoder);
            dev.encoder_info.borrow_mut().insert(
                encoder,
                DrmEncoderInfo {
                    crtc_id: DrmCrtc::NONE,
                    possible_crtcs,
                },
            );
            dev.connector_info.borrow_mut().insert(
                connector,
                DrmConnectorInfo {
                    encoders: vec![encoder],
                    modes,
                    connector_type: ty,
                    connector_type_id: 1,
                    connection,
                    mm_width: 520,
                    mm_height: 290,
                },
            );
        }
        Rc::new(dev)
    }

    fn next_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Properties with the same name share one id, like in the kernel.
    fn value(&self, name: &'static str, ty: DrmPropertyType, value: u64) -> DrmPropertyValue {
        let existing = self.prop_ids.borrow().get(name).copied();
        let id = match existing {
            Some(id) => id,
            None => {
                let id = DrmProperty(self.next_id());
                self.prop_ids.borrow_mut().insert(name, id);
                self.props.borrow_mut().insert(
                    id,
                    DrmPropertyDefinition {
                        id,
                        name: name.into(),
                        immutable: false,
                        atomic: false,
                        ty,
                    },
                );
                id
            }
        };
        DrmPropertyValue { id, value }
    }

    fn add_object<T: DrmObject>(&self, obj: T, props: Vec<DrmPropertyValue>) {
        self.objects
            .borrow_mut()
            .insert(obj.id(), Object { ty: T::TYPE, props });
    }

    pub fn prop(&self, name: &str) -> DrmProperty {
        match self.prop_ids.borrow().get(name) {
            Some(id) => *id,
            None => panic!("unknown property {}", name),
        }
    }

    pub fn remove_object(&self, id: u32) {
        self.objects.borrow_mut().remove(&id);
    }

    pub fn remove_property(&self, id: u32, name: &str) {
        let prop = self.prop(name);
        if let Some(o) = self.objects.borrow_mut().get_mut(&id) {
            o.props.retain(|p| p.id != prop);
        }
    }

    /// Makes every later property table query fail with `errno`.
    pub fn fail_property_queries(&self, errno: c::c_int) {
        self.property_errno.set(Some(errno));
    }

    pub fn set_connected(&self, connector: DrmConnector, connected: bool) {
        if let Some(info) = self.connector_info.borrow_mut().get_mut(&connector) {
            info.connection = match connected {
                true => CONNECTOR_STATUS_CONNECTED,
                false => CONNECTOR_STATUS_DISCONNECTED,
            };
            if connected && info.modes.is_empty() {
                info.modes = vec![test_mode(2560, 1440, true)];
            }
        }
    }

    pub fn reject_modifier(&self, modifier: Modifier) {
        self.rejected_modifiers.borrow_mut().push(modifier);
    }

    pub fn reject_format(&self, format: Fourcc) {
        self.rejected_formats.borrow_mut().push(format);
    }

    pub fn reject_next_commit(&self, errno: c::c_int) {
        self.reject_next_commit.set(Some(errno));
    }

    /// Keeps flip events back until `release_flips`.
    pub fn hold_flips(&self, hold: bool) {
        self.hold_flips.set(hold);
    }

    pub fn release_flips(&self) {
        let mut held = self.held.borrow_mut();
        self.events.borrow_mut().extend(held.drain(..));
    }

    pub fn inject_event(&self, event: DrmEvent) {
        self.events.borrow_mut().push_back(event);
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.commits.borrow().clone()
    }

    pub fn last_commit(&self) -> RecordedCommit {
        match self.commits.borrow().last() {
            Some(c) => c.clone(),
            None => panic!("no commits"),
        }
    }

    pub fn live_fbs(&self) -> usize {
        self.live_fbs.borrow().len()
    }

    pub fn removed_fbs(&self) -> Vec<DrmFb> {
        self.removed_fbs.borrow().clone()
    }

    pub fn live_blobs(&self) -> usize {
        self.live_blobs.borrow().len()
    }

    pub fn out_fence_count(&self) -> usize {
        self.out_fences.borrow().len()
    }

    /// Signals the out-fence of the `idx`th commit that requested one.
    pub fn signal_out_fence(&self, idx: usize) {
        let fd = self.out_fences.borrow()[idx].clone();
        signal(&fd);
    }

    fn flip_crtcs(&self, req: &AtomicRequest) -> Vec<DrmCrtc> {
        let crtcs = self.crtcs.borrow();
        let crtc_prop = self.prop_ids.borrow().get("CRTC_ID").copied();
        let mut res = vec![];
        for (obj, props) in req.iter() {
            let crtc = if crtcs.contains(&DrmCrtc(obj)) {
                Some(DrmCrtc(obj))
            } else {
                props
                    .iter()
                    .find(|(p, v)| Some(DrmProperty(*p)) == crtc_prop && *v != 0)
                    .map(|(_, v)| DrmCrtc(*v as u32))
            };
            if let Some(crtc) = crtc {
                if !res.contains(&crtc) {
                    res.push(crtc);
                }
            }
        }
        res
    }
}

fn plane_type_enum() -> DrmPropertyType {
    let values = [
        ("Overlay", PLANE_TYPE_OVERLAY),
        ("Primary", PLANE_TYPE_PRIMARY),
        ("Cursor", PLANE_TYPE_CURSOR),
    ];
    DrmPropertyType::Enum {
        values: values
            .into_iter()
            .map(|(name, value)| DrmPropertyEnumValue {
                value,
                name: name.into(),
            })
            .collect(),
        bitmask: false,
    }
}

fn enoent() -> OsError {
    OsError(c::ENOENT)
}

impl KmsDevice for TestDevice {
    fn get_object_properties(
        &self,
        id: u32,
        ty: u32,
    ) -> Result<Vec<DrmPropertyValue>, DrmError> {
        if let Some(errno) = self.property_errno.get() {
            return Err(DrmError::GetProperties(OsError(errno)));
        }
        match self.objects.borrow().get(&id) {
            Some(o) if o.ty == ty => Ok(o.props.clone()),
            _ => Err(DrmError::GetProperties(enoent())),
        }
    }

    fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError> {
        match self.props.borrow().get(&prop) {
            Some(p) => Ok(p.clone()),
            None => Err(DrmError::GetProperty(enoent())),
        }
    }

    fn get_resources(&self) -> Result<DrmCardResources, DrmError> {
        Ok(DrmCardResources {
            min_width: 0,
            max_width: 8192,
            min_height: 0,
            max_height: 8192,
            crtcs: self.crtcs.borrow().clone(),
            connectors: self.connectors.borrow().clone(),
            encoders: self.encoders.borrow().clone(),
        })
    }

    fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError> {
        Ok(self.planes.borrow().clone())
    }

    fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError> {
        match self.plane_info.borrow().get(&plane) {
            Some(i) => Ok(i.clone()),
            None => Err(DrmError::GetPlane(enoent())),
        }
    }

    fn get_connector_info(&self, connector: DrmConnector) -> Result<DrmConnectorInfo, DrmError> {
        if !self.objects.borrow().contains_key(&connector.0) {
            return Err(DrmError::GetConnector(enoent()));
        }
        match self.connector_info.borrow().get(&connector) {
            Some(i) => Ok(i.clone()),
            None => Err(DrmError::GetConnector(enoent())),
        }
    }

    fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError> {
        match self.encoder_info.borrow().get(&encoder) {
            Some(i) => Ok(i.clone()),
            None => Err(DrmError::GetEncoder(enoent())),
        }
    }

    fn add_fb(&self, dmabuf: &DmaBuf) -> Result<DrmFb, DrmError> {
        if self.rejected_modifiers.borrow().contains(&dmabuf.modifier)
            || self.rejected_formats.borrow().contains(&dmabuf.format)
        {
            return Err(DrmError::AddFb(OsError(c::EINVAL)));
        }
        let fb = DrmFb(self.next_id());
        self.live_fbs.borrow_mut().insert(fb);
        Ok(fb)
    }

    fn rm_fb(&self, fb: DrmFb) -> Result<(), DrmError> {
        if !self.live_fbs.borrow_mut().remove(&fb) {
            return Err(DrmError::RmFb(enoent()));
        }
        self.removed_fbs.borrow_mut().push(fb);
        Ok(())
    }

    fn create_mode_blob(&self, _mode: &DrmModeInfo) -> Result<DrmBlob, DrmError> {
        let blob = DrmBlob(self.next_id());
        self.live_blobs.borrow_mut().insert(blob);
        Ok(blob)
    }

    fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError> {
        match self.live_blobs.borrow_mut().remove(&blob) {
            true => Ok(()),
            false => Err(DrmError::DestroyBlob(enoent())),
        }
    }

    fn atomic_commit(
        &self,
        req: &AtomicRequest,
        flags: u32,
    ) -> Result<Option<SyncFile>, DrmError> {
        if let Some(errno) = self.reject_next_commit.take() {
            return Err(DrmError::Atomic(OsError(errno)));
        }
        let test_only = flags & DRM_MODE_ATOMIC_TEST_ONLY != 0;
        self.commits.borrow_mut().push(RecordedCommit {
            flags,
            objects: req.iter().collect(),
            out_fence: req.out_fence.is_some(),
            user_data: req.user_data,
        });
        if test_only {
            return Ok(None);
        }
        if flags & DRM_MODE_PAGE_FLIP_EVENT != 0 {
            for crtc in self.flip_crtcs(req) {
                let sequence = self.vblank.get() + 1;
                self.vblank.set(sequence);
                let event = DrmEvent::FlipComplete {
                    tv_sec: sequence / 60,
                    tv_usec: (sequence % 60) * 16_666,
                    sequence,
                    crtc_id: crtc,
                    user_data: req.user_data,
                };
                match self.hold_flips.get() {
                    true => self.held.borrow_mut().push_back(event),
                    false => self.events.borrow_mut().push_back(event),
                }
            }
        }
        if req.out_fence.is_none() {
            return Ok(None);
        }
        let fd = Rc::new(eventfd());
        self.out_fences.borrow_mut().push(fd.clone());
        Ok(Some(SyncFile(fd)))
    }

    fn next_event(&self, _timeout: Option<Duration>) -> Result<Option<DrmEvent>, DrmError> {
        Ok(self.events.borrow_mut().pop_front())
    }
}

fn eventfd() -> OwnedFd {
    uapi::eventfd(0, c::EFD_CLOEXEC).unwrap()
}

pub fn signal(fd: &OwnedFd) {
    uapi::eventfd_write(fd.raw(), 1).unwrap();
}

/// An unsignaled GPU fence and the handle to signal it with.
pub fn gpu_fence() -> (Fence, Rc<OwnedFd>) {
    let fd = Rc::new(eventfd());
    (Fence::new(FenceKind::Gpu, SyncFile(fd.clone())), fd)
}

#[derive(Default)]
pub struct TestAllocator {
    pub allocated: Cell<usize>,
}

pub struct TestBo {
    dmabuf: DmaBuf,
}

impl TestBo {
    pub fn new(
        ids: &DmaBufIds,
        width: i32,
        height: i32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Rc<Self> {
        let stride = width as u32 * 4;
        let mut planes = PlaneVec::new();
        planes.push(DmaBufPlane {
            offset: 0,
            stride,
            fd: Rc::new(eventfd()),
        });
        Rc::new(Self {
            dmabuf: DmaBuf {
                id: ids.next(),
                width,
                height,
                format,
                modifier,
                planes,
            },
        })
    }
}

impl Allocator for TestAllocator {
    fn create_bo(
        &self,
        dma_buf_ids: &DmaBufIds,
        width: i32,
        height: i32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Rc<dyn BufferObject>, AllocatorError> {
        self.allocated.set(self.allocated.get() + 1);
        Ok(TestBo::new(dma_buf_ids, width, height, format, modifier))
    }
}

impl BufferObject for TestBo {
    fn dmabuf(&self) -> &DmaBuf {
        &self.dmabuf
    }

    fn map_write(self: Rc<Self>) -> Result<Box<dyn MappedBuffer>, AllocatorError> {
        let stride = self.dmabuf.planes[0].stride;
        Ok(Box::new(TestMapping {
            data: vec![0; stride as usize * self.dmabuf.height as usize],
            stride: stride as i32,
        }))
    }
}

struct TestMapping {
    data: Vec<u8>,
    stride: i32,
}

impl MappedBuffer for TestMapping {
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn stride(&self) -> i32 {
        self.stride
    }
}
