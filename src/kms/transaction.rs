//! The pending atomic request of a display.
//!
//! Setters only accumulate. Nothing reaches the kernel before a commit or a
//! [`AtomicTransaction::test`].


use {
    crate::{
        kms::{
            KmsError,
            device::{AtomicRequest, KmsDevice},
            fence::SyncFile,
            framebuffer::Framebuffer,
            resource::{ConnectorResource, CrtcResource, PlaneResource},
        },
        utils::oserror::OsError,
        video::drm::{
            DrmBlob, DrmCrtc, DrmObject, DrmPlane, DrmProperty,
            sys::DRM_MODE_ATOMIC_TEST_ONLY,
        },
    },
    indexmap::IndexMap,
    uapi::c,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new_sized(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Debug, Default)]
struct ObjectEntry {
    ty: u32,
    props: IndexMap<DrmProperty, u64>,
}

#[derive(Debug, Default)]
pub struct AtomicTransaction {
    objects: IndexMap<u32, ObjectEntry>,
    flags: u32,
    in_fences: Vec<SyncFile>,
    out_fence: Option<(DrmCrtc, DrmProperty)>,
}

pub struct ObjectChange<'a> {
    entry: &'a mut ObjectEntry,
}

impl ObjectChange<'_> {
    pub fn change(&mut self, property_id: DrmProperty, value: u64) {
        self.entry.props.insert(property_id, value);
    }
}

impl AtomicTransaction {
    /// Starts a new frame, discarding everything accumulated so far.
    ///
    /// Allocations are kept.
    pub fn begin(&mut self) -> &mut Self {
        self.clear();
        self
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.flags = 0;
        self.in_fences.clear();
        self.out_fence = None;
    }

    pub fn is_empty(&self) -> bool {
        self.objects.values().all(|o| o.props.is_empty())
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    pub fn change_object<T, F>(&mut self, obj: T, f: F)
    where
        T: DrmObject,
        F: FnOnce(&mut ObjectChange),
    {
        let entry = self.objects.entry(obj.id()).or_insert_with(|| ObjectEntry {
            ty: T::TYPE,
            props: IndexMap::new(),
        });
        f(&mut ObjectChange { entry });
    }

    /// The value a property will be set to, if it is part of the transaction.
    pub fn value<T: DrmObject>(&self, obj: T, prop: DrmProperty) -> Option<u64> {
        self.objects.get(&obj.id())?.props.get(&prop).copied()
    }

    /// The ids of all objects touched since the last `begin`, in order.
    pub fn objects(&self) -> impl Iterator<Item = u32> + '_ {
        self.objects.keys().copied()
    }

    /// Routes `fb` through `plane` onto `crtc`.
    ///
    /// `src` is in buffer pixels and `dst` in CRTC pixels. They may differ in
    /// size if the plane scales.
    pub fn set_plane_properties(
        &mut self,
        plane: &PlaneResource,
        fb: &Framebuffer,
        crtc: DrmCrtc,
        src: Rect,
        dst: Rect,
    ) {
        let p = &plane.props;
        self.change_object(plane.id, |c| {
            c.change(p.fb_id, fb.id().0 as u64);
            c.change(p.crtc_id, crtc.0 as u64);
            c.change(p.src_x, (src.x as u64) << 16);
            c.change(p.src_y, (src.y as u64) << 16);
            c.change(p.src_w, (src.width as u64) << 16);
            c.change(p.src_h, (src.height as u64) << 16);
            c.change(p.crtc_x, dst.x as i64 as u64);
            c.change(p.crtc_y, dst.y as i64 as u64);
            c.change(p.crtc_w, dst.width as u64);
            c.change(p.crtc_h, dst.height as u64);
        });
    }

    /// Detaches the plane from its CRTC.
    pub fn disable_plane(&mut self, plane: &PlaneResource) {
        let p = &plane.props;
        self.change_object(plane.id, |c| {
            c.change(p.fb_id, 0);
            c.change(p.crtc_id, 0);
        });
    }

    /// Routes `connector` to `crtc` and programs the mode.
    pub fn set_connector_mode(
        &mut self,
        connector: &ConnectorResource,
        crtc: &CrtcResource,
        mode: DrmBlob,
    ) {
        self.change_object(connector.id, |c| {
            c.change(connector.props.crtc_id, crtc.id.0 as u64);
        });
        self.change_object(crtc.id, |c| {
            c.change(crtc.props.mode_id, mode.0 as u64);
        });
    }

    pub fn set_crtc_active(&mut self, crtc: &CrtcResource, active: bool) {
        self.change_object(crtc.id, |c| {
            c.change(crtc.props.active, active as u64);
        });
    }

    /// Detaches the connector from any CRTC.
    pub fn disable_connector(&mut self, connector: &ConnectorResource) {
        self.change_object(connector.id, |c| {
            c.change(connector.props.crtc_id, DrmCrtc::NONE.0 as u64);
        });
    }

    pub(super) fn set_in_fence(&mut self, plane: DrmPlane, prop: DrmProperty, sf: SyncFile) {
        let fd = sf.raw();
        self.in_fences.push(sf);
        self.change_object(plane, |c| c.change(prop, fd as u64));
    }

    pub(super) fn request_out_fence(&mut self, crtc: DrmCrtc, prop: DrmProperty) {
        self.out_fence = Some((crtc, prop));
    }

    pub fn has_out_fence(&self) -> bool {
        self.out_fence.is_some()
    }

    pub fn in_fence_count(&self) -> usize {
        self.in_fences.len()
    }

    /// Builds the ioctl arrays.
    pub fn flatten(&self, with_out_fence: bool, user_data: u64) -> AtomicRequest {
        let mut req = AtomicRequest {
            user_data,
            ..Default::default()
        };
        let out_fence = match self.out_fence {
            Some(of) if with_out_fence => Some(of),
            _ => None,
        };
        let mut out_fence_done = false;
        for (&id, entry) in &self.objects {
            let mut len = entry.props.len() as u32;
            let mut out_prop = None;
            if let Some((crtc, prop)) = out_fence {
                if entry.ty == DrmCrtc::TYPE && crtc.0 == id {
                    out_prop = Some(prop);
                }
            }
            if out_prop.is_some() {
                len += 1;
            }
            if len == 0 {
                continue;
            }
            req.objects.push(id);
            req.object_lengths.push(len);
            for (prop, value) in &entry.props {
                req.props.push(prop.0);
                req.values.push(*value);
            }
            if let Some(prop) = out_prop {
                req.out_fence = Some(req.values.len());
                req.props.push(prop.0);
                req.values.push(0);
                out_fence_done = true;
            }
        }
        if let Some((crtc, prop)) = out_fence {
            if !out_fence_done {
                req.objects.push(crtc.0);
                req.object_lengths.push(1);
                req.out_fence = Some(req.values.len());
                req.props.push(prop.0);
                req.values.push(0);
            }
        }
        req
    }

    /// Asks the kernel whether the transaction would be accepted.
    ///
    /// Display state is never changed.
    pub fn test(&self, dev: &dyn KmsDevice) -> Result<(), KmsError> {
        let req = self.flatten(false, 0);
        match dev.atomic_commit(&req, self.flags | DRM_MODE_ATOMIC_TEST_ONLY) {
            Ok(_) => Ok(()),
            Err(e) => Err(KmsError::AtomicCommitRejected(
                e.os_error().unwrap_or(OsError(c::EIO)),
            )),
        }
    }
}
