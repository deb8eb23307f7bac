pub mod sys;

use {
    crate::{
        utils::{errorfmt::ErrorFmt, oserror::OsError, timeout::poll_timeout},
        video::{
            INVALID_MODIFIER,
            dmabuf::DmaBuf,
            drm::sys::{
                DRM_CLIENT_CAP_ATOMIC, DRM_CLIENT_CAP_UNIVERSAL_PLANES, DRM_DISPLAY_MODE_LEN,
                DRM_MODE_FB_MODIFIERS, DRM_MODE_OBJECT_BLOB, DRM_MODE_OBJECT_CONNECTOR,
                DRM_MODE_OBJECT_CRTC, DRM_MODE_OBJECT_ENCODER, DRM_MODE_OBJECT_FB,
                DRM_MODE_OBJECT_PLANE, DRM_MODE_OBJECT_PROPERTY, drm_event, drm_event_vblank,
                drm_mode_modeinfo, gem_close, get_cap, mode_addfb2, mode_atomic,
                mode_create_blob, mode_destroy_blob, mode_get_resources, mode_getconnector,
                mode_getencoder, mode_getplane, mode_getplaneresources, mode_getproperty,
                mode_obj_getproperties, mode_rmfb, prime_fd_to_handle, set_client_cap,
            },
        },
    },
    ahash::AHashMap,
    bstr::{BString, ByteSlice},
    std::{
        cell::RefCell,
        collections::VecDeque,
        fmt::{Debug, Display, Formatter},
        rc::{Rc, Weak},
        slice,
        time::Duration,
    },
    thiserror::Error,
    uapi::{Errno, OwnedFd, c},
};

#[derive(Debug, Error)]
pub enum DrmError {
    #[error("Could not open drm device {0}")]
    Open(String, #[source] OsError),
    #[error("Could not enable universal planes")]
    UniversalPlanes(#[source] OsError),
    #[error("Could not enable atomic mode setting")]
    AtomicCap(#[source] OsError),
    #[error("Could not perform drm property ioctl")]
    GetProperty(#[source] OsError),
    #[error("Could not perform drm properties ioctl")]
    GetProperties(#[source] OsError),
    #[error("Could not perform drm getencoder ioctl")]
    GetEncoder(#[source] OsError),
    #[error("Could not perform drm getresources ioctl")]
    GetResources(#[source] OsError),
    #[error("Could not perform drm getplaneresources ioctl")]
    GetPlaneResources(#[source] OsError),
    #[error("Could not perform drm getplane ioctl")]
    GetPlane(#[source] OsError),
    #[error("Could not perform drm getconnector ioctl")]
    GetConnector(#[source] OsError),
    #[error("Could not create a blob")]
    CreateBlob(#[source] OsError),
    #[error("Could not destroy a blob")]
    DestroyBlob(#[source] OsError),
    #[error("Could not perform drm atomic ioctl")]
    Atomic(#[source] OsError),
    #[error("Could not create a framebuffer")]
    AddFb(#[source] OsError),
    #[error("Could not delete a framebuffer")]
    RmFb(#[source] OsError),
    #[error("Could not convert prime fd to gem handle")]
    GemHandle(#[source] OsError),
    #[error("Could not wait for the drm fd to become readable")]
    Poll(#[source] OsError),
    #[error("Could not read events from the drm fd")]
    ReadEvents(#[source] OsError),
    #[error("Read invalid data from drm device")]
    InvalidRead,
    #[error("Could not create a dumb buffer")]
    CreateDumb(#[source] OsError),
    #[error("Could not map a dumb buffer")]
    MapDumb(#[source] OsError),
    #[error("Could not export a dumb buffer")]
    ExportDumb(#[source] OsError),
}

impl DrmError {
    /// The errno reported by the kernel, if this error came from a syscall.
    pub fn os_error(&self) -> Option<OsError> {
        let e = match self {
            DrmError::Open(_, e)
            | DrmError::UniversalPlanes(e)
            | DrmError::AtomicCap(e)
            | DrmError::GetProperty(e)
            | DrmError::GetProperties(e)
            | DrmError::GetEncoder(e)
            | DrmError::GetResources(e)
            | DrmError::GetPlaneResources(e)
            | DrmError::GetPlane(e)
            | DrmError::GetConnector(e)
            | DrmError::CreateBlob(e)
            | DrmError::DestroyBlob(e)
            | DrmError::Atomic(e)
            | DrmError::AddFb(e)
            | DrmError::RmFb(e)
            | DrmError::GemHandle(e)
            | DrmError::Poll(e)
            | DrmError::ReadEvents(e)
            | DrmError::CreateDumb(e)
            | DrmError::MapDumb(e)
            | DrmError::ExportDumb(e) => e,
            DrmError::InvalidRead => return None,
        };
        Some(*e)
    }
}

pub struct DrmMaster {
    fd: Rc<OwnedFd>,
    path: String,
    gem_handles: RefCell<AHashMap<u32, Weak<GemHandle>>>,
    events: RefCell<VecDeque<DrmEvent>>,
    buf: RefCell<Vec<u8>>,
}

impl Debug for DrmMaster {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.fd.raw())
    }
}

impl DrmMaster {
    /// Opens a primary node and enables the client caps atomic commits depend on.
    pub fn open(path: &str) -> Result<Rc<Self>, DrmError> {
        let fd = match uapi::open(path, c::O_RDWR | c::O_CLOEXEC, 0) {
            Ok(fd) => fd,
            Err(e) => return Err(DrmError::Open(path.to_string(), e.into())),
        };
        let master = Self::from_fd(path, Rc::new(fd));
        master
            .set_client_cap(DRM_CLIENT_CAP_UNIVERSAL_PLANES, 1)
            .map_err(DrmError::UniversalPlanes)?;
        master
            .set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1)
            .map_err(DrmError::AtomicCap)?;
        log::info!("Opened {} with atomic mode setting", path);
        Ok(Rc::new(master))
    }

    fn from_fd(path: &str, fd: Rc<OwnedFd>) -> Self {
        Self {
            fd,
            path: path.to_string(),
            gem_handles: Default::default(),
            events: Default::default(),
            buf: RefCell::new(vec![0; 1024]),
        }
    }

    pub fn raw(&self) -> c::c_int {
        self.fd.raw()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get_cap(&self, cap: u64) -> Result<u64, OsError> {
        get_cap(self.raw(), cap)
    }

    pub fn set_client_cap(&self, cap: u64, value: u64) -> Result<(), OsError> {
        set_client_cap(self.raw(), cap, value)
    }

    pub fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError> {
        mode_getproperty(self.raw(), prop).map_err(DrmError::GetProperty)
    }

    pub fn get_properties(&self, id: u32, ty: u32) -> Result<Vec<DrmPropertyValue>, DrmError> {
        mode_obj_getproperties(self.raw(), id, ty).map_err(DrmError::GetProperties)
    }

    pub fn get_resources(&self) -> Result<DrmCardResources, DrmError> {
        mode_get_resources(self.raw()).map_err(DrmError::GetResources)
    }

    pub fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError> {
        mode_getplaneresources(self.raw()).map_err(DrmError::GetPlaneResources)
    }

    pub fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError> {
        mode_getplane(self.raw(), plane.0).map_err(DrmError::GetPlane)
    }

    pub fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError> {
        mode_getencoder(self.raw(), encoder.0).map_err(DrmError::GetEncoder)
    }

    pub fn get_connector_info(
        &self,
        connector: DrmConnector,
        force: bool,
    ) -> Result<DrmConnectorInfo, DrmError> {
        mode_getconnector(self.raw(), connector.0, force).map_err(DrmError::GetConnector)
    }

    pub fn create_blob<T>(&self, t: &T) -> Result<DrmBlob, DrmError> {
        mode_create_blob(self.raw(), t).map_err(DrmError::CreateBlob)
    }

    pub fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError> {
        mode_destroy_blob(self.raw(), blob).map_err(DrmError::DestroyBlob)
    }

    pub fn add_fb(&self, dma: &DmaBuf) -> Result<DrmFb, DrmError> {
        let mut modifier = 0;
        let mut flags = 0;
        if dma.modifier != INVALID_MODIFIER {
            modifier = dma.modifier;
            flags |= DRM_MODE_FB_MODIFIERS;
        }
        let mut strides = [0; 4];
        let mut offsets = [0; 4];
        let mut modifiers = [0; 4];
        let mut handles = [0; 4];
        let mut handles_ = vec![];
        for (idx, plane) in dma.planes.iter().enumerate() {
            strides[idx] = plane.stride;
            offsets[idx] = plane.offset;
            modifiers[idx] = modifier;
            let handle = self.gem_handle(plane.fd.raw())?;
            handles[idx] = handle.handle;
            handles_.push(handle);
        }
        mode_addfb2(
            self.raw(),
            dma.width as _,
            dma.height as _,
            dma.format.0,
            flags,
            handles,
            strides,
            offsets,
            modifiers,
        )
        .map_err(DrmError::AddFb)
    }

    pub fn rm_fb(&self, fb: DrmFb) -> Result<(), DrmError> {
        mode_rmfb(self.raw(), fb).map_err(DrmError::RmFb)
    }

    fn gem_handle(&self, fd: c::c_int) -> Result<Rc<GemHandle>, DrmError> {
        let handle = prime_fd_to_handle(self.raw(), fd).map_err(DrmError::GemHandle)?;
        let mut handles = self.gem_handles.borrow_mut();
        if let Some(h) = handles.get(&handle).and_then(|h| h.upgrade()) {
            return Ok(h);
        }
        let h = Rc::new(GemHandle {
            fd: self.fd.clone(),
            handle,
        });
        handles.insert(handle, Rc::downgrade(&h));
        Ok(h)
    }

    /// Submits an atomic request.
    ///
    /// If `out_fence` names an index into `values`, that value is replaced by a
    /// pointer the kernel fills with a sync file for the commit.
    pub fn atomic(
        &self,
        flags: u32,
        objects: &[u32],
        object_lengths: &[u32],
        props: &[u32],
        values: &[u64],
        out_fence: Option<usize>,
        user_data: u64,
    ) -> Result<Option<OwnedFd>, DrmError> {
        let mut out_fd: c::c_int = -1;
        let mut patched;
        let mut values = values;
        if let Some(idx) = out_fence {
            patched = values.to_vec();
            patched[idx] = &raw mut out_fd as u64;
            values = &patched;
        }
        mode_atomic(
            self.raw(),
            flags,
            objects,
            object_lengths,
            props,
            values,
            user_data,
        )
        .map_err(DrmError::Atomic)?;
        if out_fd < 0 {
            return Ok(None);
        }
        Ok(Some(OwnedFd::new(out_fd)))
    }

    /// Returns the next queued event, reading from the device if necessary.
    ///
    /// `None` as timeout blocks until an event arrives. Returns `None` if the
    /// timeout expires first.
    pub fn event(&self, timeout: Option<Duration>) -> Result<Option<DrmEvent>, DrmError> {
        if let Some(e) = self.events.borrow_mut().pop_front() {
            return Ok(Some(e));
        }
        let mut pollfd = c::pollfd {
            fd: self.raw(),
            events: c::POLLIN,
            revents: 0,
        };
        let timeout = poll_timeout(timeout);
        loop {
            match uapi::poll(slice::from_mut(&mut pollfd), timeout) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(Errno(c::EINTR)) => continue,
                Err(e) => return Err(DrmError::Poll(e.into())),
            }
        }
        self.read_events()?;
        Ok(self.events.borrow_mut().pop_front())
    }

    fn read_events(&self) -> Result<(), DrmError> {
        let mut buf = self.buf.borrow_mut();
        let mut buf = match uapi::read(self.raw(), &mut buf[..]) {
            Ok(b) => &*b,
            Err(Errno(c::EAGAIN)) => return Ok(()),
            Err(e) => return Err(DrmError::ReadEvents(e.into())),
        };
        let mut events = self.events.borrow_mut();
        while buf.len() > 0 {
            let header: drm_event = match uapi::pod_read_init(buf) {
                Ok(e) => e,
                _ => return Err(DrmError::InvalidRead),
            };
            let len = header.length as usize;
            if len > buf.len() || len == 0 {
                return Err(DrmError::InvalidRead);
            }
            if header.ty == sys::DRM_EVENT_FLIP_COMPLETE {
                let event: drm_event_vblank = match uapi::pod_read_init(buf) {
                    Ok(e) => e,
                    _ => return Err(DrmError::InvalidRead),
                };
                events.push_back(DrmEvent::FlipComplete {
                    tv_sec: event.tv_sec,
                    tv_usec: event.tv_usec,
                    sequence: event.sequence,
                    crtc_id: DrmCrtc(event.crtc_id),
                    user_data: event.user_data,
                });
            }
            buf = &buf[len..];
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DrmEvent {
    FlipComplete {
        tv_sec: u32,
        tv_usec: u32,
        sequence: u32,
        crtc_id: DrmCrtc,
        user_data: u64,
    },
}

struct GemHandle {
    fd: Rc<OwnedFd>,
    handle: u32,
}

impl Drop for GemHandle {
    fn drop(&mut self) {
        if let Err(e) = gem_close(self.fd.raw(), self.handle) {
            log::error!("Could not close gem handle: {}", ErrorFmt(e));
        }
    }
}

pub trait DrmObject {
    const TYPE: u32;
    const NONE: Self;
    fn id(&self) -> u32;
    fn is_some(&self) -> bool;
    fn is_none(&self) -> bool;
}

macro_rules! drm_obj {
    ($name:ident, $ty:expr) => {
        #[repr(transparent)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Ord, PartialOrd)]
        pub struct $name(pub u32);

        impl DrmObject for $name {
            const TYPE: u32 = $ty;
            const NONE: Self = Self(0);

            fn id(&self) -> u32 {
                self.0
            }

            fn is_some(&self) -> bool {
                self.0 != 0
            }

            fn is_none(&self) -> bool {
                self.0 == 0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}
drm_obj!(DrmCrtc, DRM_MODE_OBJECT_CRTC);
drm_obj!(DrmConnector, DRM_MODE_OBJECT_CONNECTOR);
drm_obj!(DrmEncoder, DRM_MODE_OBJECT_ENCODER);
drm_obj!(DrmProperty, DRM_MODE_OBJECT_PROPERTY);
drm_obj!(DrmFb, DRM_MODE_OBJECT_FB);
drm_obj!(DrmBlob, DRM_MODE_OBJECT_BLOB);
drm_obj!(DrmPlane, DRM_MODE_OBJECT_PLANE);

#[derive(Debug, Clone)]
pub struct DrmCardResources {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub crtcs: Vec<DrmCrtc>,
    pub connectors: Vec<DrmConnector>,
    pub encoders: Vec<DrmEncoder>,
}

#[derive(Debug, Clone)]
pub struct DrmPlaneInfo {
    pub crtc_id: DrmCrtc,
    pub fb_id: DrmFb,
    pub possible_crtcs: u32,
    pub format_types: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct DrmEncoderInfo {
    pub crtc_id: DrmCrtc,
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DrmModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,

    pub vrefresh: u32,

    pub flags: u32,
    pub ty: u32,
    pub name: BString,
}

impl DrmModeInfo {
    pub fn to_raw(&self) -> drm_mode_modeinfo {
        let mut name = [0u8; DRM_DISPLAY_MODE_LEN];
        let len = name.len().min(self.name.len());
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        drm_mode_modeinfo {
            clock: self.clock,
            hdisplay: self.hdisplay,
            hsync_start: self.hsync_start,
            hsync_end: self.hsync_end,
            htotal: self.htotal,
            hskew: self.hskew,
            vdisplay: self.vdisplay,
            vsync_start: self.vsync_start,
            vsync_end: self.vsync_end,
            vtotal: self.vtotal,
            vscan: self.vscan,
            vrefresh: self.vrefresh,
            flags: self.flags,
            ty: self.ty,
            name,
        }
    }

    pub fn is_preferred(&self) -> bool {
        self.ty & sys::DRM_MODE_TYPE_PREFERRED != 0
    }

    pub fn refresh_rate_millihz(&self) -> u32 {
        let htotal = self.htotal as u64;
        let vtotal = self.vtotal as u64;
        if htotal == 0 || vtotal == 0 {
            return self.vrefresh * 1000;
        }
        let clock_millihz = self.clock as u64 * 1_000_000;
        (((clock_millihz / htotal) + (vtotal / 2)) / vtotal) as u32
    }
}

impl Display for DrmModeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mhz = self.refresh_rate_millihz();
        write!(
            f,
            "{}x{}@{}.{:03}",
            self.hdisplay,
            self.vdisplay,
            mhz / 1000,
            mhz % 1000
        )
    }
}

#[derive(Debug, Clone)]
pub struct DrmConnectorInfo {
    pub encoders: Vec<DrmEncoder>,
    pub modes: Vec<DrmModeInfo>,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
}

#[derive(Debug, Clone)]
pub struct DrmPropertyDefinition {
    pub id: DrmProperty,
    pub name: BString,
    pub immutable: bool,
    pub atomic: bool,
    pub ty: DrmPropertyType,
}

#[derive(Debug, Clone)]
pub enum DrmPropertyType {
    Range {
        min: u64,
        max: u64,
    },
    SignedRange {
        min: i64,
        max: i64,
    },
    Object {
        ty: u32,
    },
    Blob,
    Enum {
        values: Vec<DrmPropertyEnumValue>,
        bitmask: bool,
    },
}

impl DrmPropertyType {
    /// Looks up the name of an enum variant by value.
    pub fn enum_name(&self, value: u64) -> Option<&BString> {
        match self {
            DrmPropertyType::Enum {
                values,
                bitmask: false,
            } => values.iter().find(|v| v.value == value).map(|v| &v.name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrmPropertyEnumValue {
    pub value: u64,
    pub name: BString,
}

#[derive(Debug, Copy, Clone)]
pub struct DrmPropertyValue {
    pub id: DrmProperty,
    pub value: u64,
}

#[expect(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectorType {
    Unknown(u32),
    VGA,
    DVII,
    DVID,
    DVIA,
    Composite,
    SVIDEO,
    LVDS,
    Component,
    _9PinDIN,
    DisplayPort,
    HDMIA,
    HDMIB,
    TV,
    eDP,
    VIRTUAL,
    DSI,
    DPI,
    WRITEBACK,
    SPI,
    USB,
}

impl ConnectorType {
    pub fn from_drm(v: u32) -> Self {
        match v {
            sys::DRM_MODE_CONNECTOR_VGA => Self::VGA,
            sys::DRM_MODE_CONNECTOR_DVII => Self::DVII,
            sys::DRM_MODE_CONNECTOR_DVID => Self::DVID,
            sys::DRM_MODE_CONNECTOR_DVIA => Self::DVIA,
            sys::DRM_MODE_CONNECTOR_Composite => Self::Composite,
            sys::DRM_MODE_CONNECTOR_SVIDEO => Self::SVIDEO,
            sys::DRM_MODE_CONNECTOR_LVDS => Self::LVDS,
            sys::DRM_MODE_CONNECTOR_Component => Self::Component,
            sys::DRM_MODE_CONNECTOR_9PinDIN => Self::_9PinDIN,
            sys::DRM_MODE_CONNECTOR_DisplayPort => Self::DisplayPort,
            sys::DRM_MODE_CONNECTOR_HDMIA => Self::HDMIA,
            sys::DRM_MODE_CONNECTOR_HDMIB => Self::HDMIB,
            sys::DRM_MODE_CONNECTOR_TV => Self::TV,
            sys::DRM_MODE_CONNECTOR_eDP => Self::eDP,
            sys::DRM_MODE_CONNECTOR_VIRTUAL => Self::VIRTUAL,
            sys::DRM_MODE_CONNECTOR_DSI => Self::DSI,
            sys::DRM_MODE_CONNECTOR_DPI => Self::DPI,
            sys::DRM_MODE_CONNECTOR_WRITEBACK => Self::WRITEBACK,
            sys::DRM_MODE_CONNECTOR_SPI => Self::SPI,
            sys::DRM_MODE_CONNECTOR_USB => Self::USB,
            _ => Self::Unknown(v),
        }
    }
}

impl Display for ConnectorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown(n) => return write!(f, "Unknown({})", n),
            Self::VGA => "VGA",
            Self::DVII => "DVI-I",
            Self::DVID => "DVI-D",
            Self::DVIA => "DVI-A",
            Self::Composite => "Composite",
            Self::SVIDEO => "SVIDEO",
            Self::LVDS => "LVDS",
            Self::Component => "Component",
            Self::_9PinDIN => "DIN",
            Self::DisplayPort => "DP",
            Self::HDMIA => "HDMI-A",
            Self::HDMIB => "HDMI-B",
            Self::TV => "TV",
            Self::eDP => "eDP",
            Self::VIRTUAL => "Virtual",
            Self::DSI => "DSI",
            Self::DPI => "DPI",
            Self::WRITEBACK => "Writeback",
            Self::SPI => "SPI",
            Self::USB => "USB",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
    Unknown,
    Other(u32),
}

impl ConnectorStatus {
    pub fn from_drm(v: u32) -> Self {
        match v {
            sys::CONNECTOR_STATUS_CONNECTED => Self::Connected,
            sys::CONNECTOR_STATUS_DISCONNECTED => Self::Disconnected,
            sys::CONNECTOR_STATUS_UNKNOWN => Self::Unknown,
            _ => Self::Other(v),
        }
    }
}
