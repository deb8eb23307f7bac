//! Display objects and their property tables.
//!
//! Property tables are read once at discovery. Afterwards only the atomic
//! transaction writes values.


use {
    crate::{
        kms::{KmsError, PropertyError, device::KmsDevice},
        utils::errorfmt::ErrorFmt,
        video::{
            Fourcc,
            drm::{
                ConnectorStatus, ConnectorType, DrmConnector, DrmCrtc, DrmError, DrmModeInfo,
                DrmObject, DrmPlane, DrmProperty, DrmPropertyDefinition,
            },
        },
    },
    ahash::{AHashMap, AHashSet},
    bstr::{BStr, BString, ByteSlice},
    indexmap::IndexMap,
    std::{
        fmt::{Display, Formatter},
        mem,
        rc::Rc,
    },
    uapi::c,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PlaneType {
    Primary,
    Overlay,
    Cursor,
}

impl PlaneType {
    fn from_name(name: &[u8]) -> Option<Self> {
        let ty = match name {
            b"Primary" => Self::Primary,
            b"Overlay" => Self::Overlay,
            b"Cursor" => Self::Cursor,
            _ => return None,
        };
        Some(ty)
    }
}

impl Display for PlaneType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlaneType::Primary => "primary",
            PlaneType::Overlay => "overlay",
            PlaneType::Cursor => "cursor",
        };
        f.write_str(s)
    }
}

/// Property definitions are shared between all objects that expose them.
#[derive(Default)]
struct PropertyCache {
    definitions: AHashMap<DrmProperty, Rc<DrmPropertyDefinition>>,
}

impl PropertyCache {
    fn get(
        &mut self,
        dev: &dyn KmsDevice,
        prop: DrmProperty,
    ) -> Result<Rc<DrmPropertyDefinition>, DrmError> {
        if let Some(def) = self.definitions.get(&prop) {
            return Ok(def.clone());
        }
        let def = Rc::new(dev.get_property(prop)?);
        self.definitions.insert(prop, def.clone());
        Ok(def)
    }
}

#[derive(Debug, Clone)]
pub struct PropertyEntry {
    pub definition: Rc<DrmPropertyDefinition>,
    pub value: u64,
}

/// The properties of one object by name, with the values seen at discovery.
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    props: IndexMap<BString, PropertyEntry>,
}

impl PropertyTable {
    pub fn get(&self, name: &str) -> Option<&PropertyEntry> {
        self.props.get(name.as_bytes().as_bstr())
    }

    pub fn id(&self, name: &str) -> Option<DrmProperty> {
        self.get(name).map(|p| p.definition.id)
    }

    pub fn value(&self, name: &str) -> Option<u64> {
        self.get(name).map(|p| p.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BStr, &PropertyEntry)> {
        self.props.iter().map(|(n, p)| (n.as_bstr(), p))
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    fn required(&self, obj: u32, name: &'static str) -> Result<DrmProperty, KmsError> {
        match self.id(name) {
            Some(id) => Ok(id),
            None => Err(KmsError::PropertyQueryFailed {
                id: obj,
                source: PropertyError::Missing(name),
            }),
        }
    }
}

fn collect_properties<T: DrmObject>(
    dev: &dyn KmsDevice,
    cache: &mut PropertyCache,
    obj: T,
) -> Result<PropertyTable, KmsError> {
    let query_failed = |e: DrmError| KmsError::PropertyQueryFailed {
        id: obj.id(),
        source: PropertyError::Drm(e),
    };
    let values = match dev.get_object_properties(obj.id(), T::TYPE) {
        Ok(v) => v,
        Err(e) if e.os_error().is_some_and(|e| e.errno() == c::ENOENT) => {
            return Err(KmsError::ResourceUnavailable(obj.id()));
        }
        Err(e) => return Err(query_failed(e)),
    };
    let mut props = IndexMap::new();
    for value in values {
        let definition = cache.get(dev, value.id).map_err(query_failed)?;
        props.insert(
            definition.name.clone(),
            PropertyEntry {
                definition,
                value: value.value,
            },
        );
    }
    Ok(PropertyTable { props })
}

#[derive(Debug, Clone)]
pub struct PlaneProps {
    pub fb_id: DrmProperty,
    pub crtc_id: DrmProperty,
    pub src_x: DrmProperty,
    pub src_y: DrmProperty,
    pub src_w: DrmProperty,
    pub src_h: DrmProperty,
    pub crtc_x: DrmProperty,
    pub crtc_y: DrmProperty,
    pub crtc_w: DrmProperty,
    pub crtc_h: DrmProperty,
    pub ty: DrmProperty,
    pub in_fence_fd: Option<DrmProperty>,
}

#[derive(Debug, Clone)]
pub struct CrtcProps {
    pub active: DrmProperty,
    pub mode_id: DrmProperty,
    pub out_fence_ptr: Option<DrmProperty>,
}

#[derive(Debug, Clone)]
pub struct ConnectorProps {
    pub crtc_id: DrmProperty,
}

#[derive(Debug, Clone)]
pub struct PlaneResource {
    pub id: DrmPlane,
    pub ty: PlaneType,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
    pub table: PropertyTable,
    pub props: PlaneProps,
}

impl PlaneResource {
    pub fn supports_format(&self, format: Fourcc) -> bool {
        self.formats.contains(&format.0)
    }

    pub fn supports_crtc(&self, crtc: &CrtcResource) -> bool {
        self.possible_crtcs & (1 << crtc.idx) != 0
    }
}

#[derive(Debug, Clone)]
pub struct CrtcResource {
    pub id: DrmCrtc,
    /// Position in the kernel's CRTC list, as used by `possible_crtcs` masks.
    pub idx: usize,
    pub table: PropertyTable,
    pub props: CrtcProps,
}

#[derive(Debug, Clone)]
pub struct ConnectorResource {
    pub id: DrmConnector,
    pub name: String,
    pub connector_type: ConnectorType,
    pub status: ConnectorStatus,
    /// Preferred mode first.
    pub modes: Vec<DrmModeInfo>,
    pub possible_crtcs: u32,
    pub current_crtc: Option<DrmCrtc>,
    pub mm_width: u32,
    pub mm_height: u32,
    pub table: PropertyTable,
    pub props: ConnectorProps,
}

impl ConnectorResource {
    pub fn connected(&self) -> bool {
        self.status == ConnectorStatus::Connected
    }
}

#[derive(Debug, Clone)]
pub enum DisplayResource {
    Plane(PlaneResource),
    Crtc(CrtcResource),
    Connector(ConnectorResource),
}

impl DisplayResource {
    pub fn id(&self) -> u32 {
        match self {
            DisplayResource::Plane(p) => p.id.0,
            DisplayResource::Crtc(c) => c.id.0,
            DisplayResource::Connector(c) => c.id.0,
        }
    }

    pub fn table(&self) -> &PropertyTable {
        match self {
            DisplayResource::Plane(p) => &p.table,
            DisplayResource::Crtc(c) => &c.table,
            DisplayResource::Connector(c) => &c.table,
        }
    }
}

pub fn discover_crtc(
    dev: &dyn KmsDevice,
    crtc: DrmCrtc,
    idx: usize,
) -> Result<CrtcResource, KmsError> {
    discover_crtc_(dev, &mut PropertyCache::default(), crtc, idx)
}

fn discover_crtc_(
    dev: &dyn KmsDevice,
    cache: &mut PropertyCache,
    crtc: DrmCrtc,
    idx: usize,
) -> Result<CrtcResource, KmsError> {
    let table = collect_properties(dev, cache, crtc)?;
    let props = CrtcProps {
        active: table.required(crtc.0, "ACTIVE")?,
        mode_id: table.required(crtc.0, "MODE_ID")?,
        out_fence_ptr: table.id("OUT_FENCE_PTR"),
    };
    Ok(CrtcResource {
        id: crtc,
        idx,
        table,
        props,
    })
}

pub fn discover_plane(dev: &dyn KmsDevice, plane: DrmPlane) -> Result<PlaneResource, KmsError> {
    discover_plane_(dev, &mut PropertyCache::default(), plane)
}

fn discover_plane_(
    dev: &dyn KmsDevice,
    cache: &mut PropertyCache,
    plane: DrmPlane,
) -> Result<PlaneResource, KmsError> {
    let info = match dev.get_plane_info(plane) {
        Ok(i) => i,
        Err(e) if e.os_error().is_some_and(|e| e.errno() == c::ENOENT) => {
            return Err(KmsError::ResourceUnavailable(plane.0));
        }
        Err(e) => {
            return Err(KmsError::PropertyQueryFailed {
                id: plane.0,
                source: e.into(),
            });
        }
    };
    let table = collect_properties(dev, cache, plane)?;
    let id = plane.0;
    let props = PlaneProps {
        fb_id: table.required(id, "FB_ID")?,
        crtc_id: table.required(id, "CRTC_ID")?,
        src_x: table.required(id, "SRC_X")?,
        src_y: table.required(id, "SRC_Y")?,
        src_w: table.required(id, "SRC_W")?,
        src_h: table.required(id, "SRC_H")?,
        crtc_x: table.required(id, "CRTC_X")?,
        crtc_y: table.required(id, "CRTC_Y")?,
        crtc_w: table.required(id, "CRTC_W")?,
        crtc_h: table.required(id, "CRTC_H")?,
        ty: table.required(id, "type")?,
        in_fence_fd: table.id("IN_FENCE_FD"),
    };
    let ty = table
        .get("type")
        .and_then(|p| p.definition.ty.enum_name(p.value))
        .and_then(|n| PlaneType::from_name(n));
    let Some(ty) = ty else {
        return Err(KmsError::PropertyQueryFailed {
            id,
            source: PropertyError::InvalidType("type"),
        });
    };
    Ok(PlaneResource {
        id: plane,
        ty,
        possible_crtcs: info.possible_crtcs,
        formats: info.format_types,
        table,
        props,
    })
}

pub fn discover_connector(
    dev: &dyn KmsDevice,
    connector: DrmConnector,
) -> Result<ConnectorResource, KmsError> {
    discover_connector_(dev, &mut PropertyCache::default(), connector)
}

fn discover_connector_(
    dev: &dyn KmsDevice,
    cache: &mut PropertyCache,
    connector: DrmConnector,
) -> Result<ConnectorResource, KmsError> {
    let info = match dev.get_connector_info(connector) {
        Ok(i) => i,
        Err(e) if e.os_error().is_some_and(|e| e.errno() == c::ENOENT) => {
            return Err(KmsError::ResourceUnavailable(connector.0));
        }
        Err(e) => {
            return Err(KmsError::PropertyQueryFailed {
                id: connector.0,
                source: e.into(),
            });
        }
    };
    let table = collect_properties(dev, cache, connector)?;
    let props = ConnectorProps {
        crtc_id: table.required(connector.0, "CRTC_ID")?,
    };
    let mut possible_crtcs = 0;
    let mut current_crtc = None;
    for encoder in &info.encoders {
        match dev.get_encoder_info(*encoder) {
            Ok(e) => {
                possible_crtcs |= e.possible_crtcs;
                if e.crtc_id.is_some() && current_crtc.is_none() {
                    current_crtc = Some(e.crtc_id);
                }
            }
            Err(e) => {
                log::warn!(
                    "Could not query encoder {} of connector {}: {}",
                    encoder,
                    connector,
                    ErrorFmt(e)
                );
            }
        }
    }
    let connector_type = ConnectorType::from_drm(info.connector_type);
    let mut modes = info.modes;
    modes.sort_by_key(|m| !m.is_preferred());
    Ok(ConnectorResource {
        id: connector,
        name: format!("{}-{}", connector_type, info.connector_type_id),
        connector_type,
        status: ConnectorStatus::from_drm(info.connection),
        modes,
        possible_crtcs,
        current_crtc,
        mm_width: info.mm_width,
        mm_height: info.mm_height,
        table,
        props,
    })
}

/// All display objects of a device, indexed by object id.
#[derive(Default)]
pub struct ResourceArena {
    resources: IndexMap<u32, DisplayResource>,
    crtcs: Vec<DrmCrtc>,
    connectors: Vec<DrmConnector>,
    planes: Vec<DrmPlane>,
    claimed_planes: AHashSet<DrmPlane>,
    cache: PropertyCache,
}

impl ResourceArena {
    pub fn discover_all(dev: &dyn KmsDevice) -> Result<Self, KmsError> {
        let mut arena = Self::default();
        arena.refresh(dev)?;
        Ok(arena)
    }

    /// Re-queries every object after a topology change.
    ///
    /// Plane claims are dropped. If any query fails, the arena keeps the
    /// objects it knew before.
    pub fn refresh(&mut self, dev: &dyn KmsDevice) -> Result<(), KmsError> {
        let res = dev.get_resources().map_err(KmsError::Device)?;
        let planes = dev.get_planes().map_err(KmsError::Device)?;
        let mut fresh = Self::default();
        fresh.populate(dev, &mut self.cache, &res.crtcs, &res.connectors, &planes)?;
        fresh.cache = mem::take(&mut self.cache);
        *self = fresh;
        log::debug!(
            "Discovered {} CRTCs, {} connectors and {} planes",
            self.crtcs.len(),
            self.connectors.len(),
            self.planes.len(),
        );
        Ok(())
    }

    fn populate(
        &mut self,
        dev: &dyn KmsDevice,
        cache: &mut PropertyCache,
        crtcs: &[DrmCrtc],
        connectors: &[DrmConnector],
        planes: &[DrmPlane],
    ) -> Result<(), KmsError> {
        for (idx, &crtc) in crtcs.iter().enumerate() {
            let crtc = discover_crtc_(dev, cache, crtc, idx)?;
            self.crtcs.push(crtc.id);
            self.resources
                .insert(crtc.id.0, DisplayResource::Crtc(crtc));
        }
        for &connector in connectors {
            match discover_connector_(dev, cache, connector) {
                Ok(c) => {
                    self.connectors.push(c.id);
                    self.resources.insert(c.id.0, DisplayResource::Connector(c));
                }
                Err(KmsError::ResourceUnavailable(_)) => {
                    log::info!("Connector {} disappeared during discovery", connector);
                }
                Err(e) => return Err(e),
            }
        }
        for &plane in planes {
            let plane = discover_plane_(dev, cache, plane)?;
            self.planes.push(plane.id);
            self.resources
                .insert(plane.id.0, DisplayResource::Plane(plane));
        }
        Ok(())
    }

    /// Re-queries a single known object.
    pub fn discover(
        &mut self,
        dev: &dyn KmsDevice,
        id: u32,
    ) -> Result<&DisplayResource, KmsError> {
        let res = match self.resources.get(&id) {
            None => return Err(KmsError::ResourceUnavailable(id)),
            Some(DisplayResource::Crtc(c)) => {
                DisplayResource::Crtc(discover_crtc_(dev, &mut self.cache, c.id, c.idx)?)
            }
            Some(DisplayResource::Plane(p)) => {
                DisplayResource::Plane(discover_plane_(dev, &mut self.cache, p.id)?)
            }
            Some(DisplayResource::Connector(c)) => {
                DisplayResource::Connector(discover_connector_(dev, &mut self.cache, c.id)?)
            }
        };
        self.resources.insert(id, res);
        match self.resources.get(&id) {
            Some(r) => Ok(r),
            None => Err(KmsError::ResourceUnavailable(id)),
        }
    }

    pub fn get(&self, id: u32) -> Option<&DisplayResource> {
        self.resources.get(&id)
    }

    pub fn crtc(&self, crtc: DrmCrtc) -> Option<&CrtcResource> {
        match self.resources.get(&crtc.0) {
            Some(DisplayResource::Crtc(c)) => Some(c),
            _ => None,
        }
    }

    pub fn plane(&self, plane: DrmPlane) -> Option<&PlaneResource> {
        match self.resources.get(&plane.0) {
            Some(DisplayResource::Plane(p)) => Some(p),
            _ => None,
        }
    }

    pub fn connector(&self, connector: DrmConnector) -> Option<&ConnectorResource> {
        match self.resources.get(&connector.0) {
            Some(DisplayResource::Connector(c)) => Some(c),
            _ => None,
        }
    }

    pub fn crtcs(&self) -> impl Iterator<Item = &CrtcResource> {
        self.crtcs.iter().filter_map(|c| self.crtc(*c))
    }

    pub fn connectors(&self) -> impl Iterator<Item = &ConnectorResource> {
        self.connectors.iter().filter_map(|c| self.connector(*c))
    }

    pub fn planes(&self) -> impl Iterator<Item = &PlaneResource> {
        self.planes.iter().filter_map(|p| self.plane(*p))
    }

    pub fn connector_by_name(&self, name: &str) -> Option<&ConnectorResource> {
        self.connectors().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The CRTC to drive `connector` with, preferring the one already bound.
    pub fn crtc_for_connector(&self, connector: &ConnectorResource) -> Option<DrmCrtc> {
        if let Some(crtc) = connector.current_crtc {
            if self.crtc(crtc).is_some() {
                return Some(crtc);
            }
        }
        self.crtcs()
            .find(|c| connector.possible_crtcs & (1 << c.idx) != 0)
            .map(|c| c.id)
    }

    /// Claims the first unclaimed plane of type `ty` that can drive `crtc`.
    pub fn setup_plane(&mut self, crtc: DrmCrtc, ty: PlaneType) -> Result<DrmPlane, KmsError> {
        let Some(crtc_res) = self.crtc(crtc) else {
            return Err(KmsError::ResourceUnavailable(crtc.0));
        };
        let plane = self
            .planes()
            .find(|p| {
                p.ty == ty && p.supports_crtc(crtc_res) && !self.claimed_planes.contains(&p.id)
            })
            .map(|p| p.id);
        match plane {
            Some(p) => {
                self.claimed_planes.insert(p);
                log::debug!("Using {} plane {} on CRTC {}", ty, p, crtc);
                Ok(p)
            }
            None => Err(KmsError::NoPlane(crtc.0, ty)),
        }
    }

    pub fn free_plane(&mut self, plane: DrmPlane) {
        self.claimed_planes.remove(&plane);
    }
}
