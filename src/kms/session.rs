//! The renderer-facing side of one display.
//!
//! A session owns the device objects it drives, the single pending
//! transaction and a pool of two scanout buffers. The renderer acquires a
//! buffer, draws into it and presents it. The buffer the display was reading
//! before becomes acquirable again once the display is done with it.

#[cfg(test)]
mod tests;

use {
    crate::{
        allocator::{Allocator, BufferObject},
        config::{POOL_DEPTH, SessionConfig},
        kms::{
            KmsError,
            commit::{CommitEngine, CommitResult, FlipInfo},
            device::{KmsDevice, ModeBlob},
            fence::{Fence, FenceStatus, attach_in_fence, create_out_fence},
            framebuffer::{Framebuffer, FramebufferRegistrar},
            resource::{PlaneType, ResourceArena},
            transaction::{AtomicTransaction, Rect},
        },
        utils::errorfmt::ErrorFmt,
        video::{
            Fourcc, LINEAR_MODIFIER, Modifier, XRGB8888,
            dmabuf::{DmaBufId, DmaBufIds},
            drm::{DrmConnector, DrmCrtc, DrmEvent, DrmModeInfo, DrmPlane},
        },
    },
    std::rc::Rc,
};

#[derive(Clone)]
pub struct CursorImage {
    pub buffer: Rc<dyn BufferObject>,
    pub x: i32,
    pub y: i32,
    pub hot_x: i32,
    pub hot_y: i32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferState {
    /// Can be handed to the renderer.
    Free,
    /// Owned by the renderer.
    Rendering,
    /// Part of the commit whose flip is outstanding.
    Queued,
    /// Being scanned out.
    Scanout,
    /// Replaced by a newer commit but possibly still read by the display.
    Retiring,
}

enum SlotState {
    Free,
    Rendering,
    Queued,
    Scanout,
    /// Without an out-fence the buffer is released by the next flip.
    Retiring(Option<Fence>),
}

struct Slot {
    bo: Rc<dyn BufferObject>,
    fb: Rc<Framebuffer>,
    state: SlotState,
}

impl Slot {
    fn id(&self) -> DmaBufId {
        self.bo.dmabuf().id
    }

    fn public_state(&self) -> BufferState {
        match self.state {
            SlotState::Free => BufferState::Free,
            SlotState::Rendering => BufferState::Rendering,
            SlotState::Queued => BufferState::Queued,
            SlotState::Scanout => BufferState::Scanout,
            SlotState::Retiring(_) => BufferState::Retiring,
        }
    }
}

struct Pipeline {
    connector: DrmConnector,
    connector_name: String,
    crtc: DrmCrtc,
    primary: DrmPlane,
    cursor: Option<DrmPlane>,
    mode: ModeBlob,
}

struct CursorState {
    image: CursorImage,
    fb: Rc<Framebuffer>,
}

pub struct DisplaySession {
    dev: Rc<dyn KmsDevice>,
    allocator: Rc<dyn Allocator>,
    config: SessionConfig,
    arena: ResourceArena,
    registrar: FramebufferRegistrar,
    tx: AtomicTransaction,
    engine: CommitEngine,
    pipeline: Option<Pipeline>,
    dma_buf_ids: DmaBufIds,
    slots: Vec<Slot>,
    format: Fourcc,
    modifier: Modifier,
    cursor: Option<CursorState>,
    /// Framebuffers that may still be read, tagged with the sequence of the
    /// first commit that no longer references them.
    retired: Vec<(u64, Rc<Framebuffer>)>,
}

impl DisplaySession {
    pub fn new(
        dev: Rc<dyn KmsDevice>,
        allocator: Rc<dyn Allocator>,
        config: SessionConfig,
    ) -> Result<Self, KmsError> {
        let mut arena = ResourceArena::discover_all(&*dev)?;
        let pipeline = select_pipeline(&dev, &mut arena, &config)?;
        let mut slf = Self {
            registrar: FramebufferRegistrar::new(&dev),
            engine: CommitEngine::new(pipeline.crtc),
            dev,
            allocator,
            arena,
            tx: Default::default(),
            pipeline: Some(pipeline),
            dma_buf_ids: Default::default(),
            slots: vec![],
            format: config.format,
            modifier: config.modifier,
            cursor: None,
            retired: vec![],
            config,
        };
        slf.allocate_pool()?;
        Ok(slf)
    }

    fn pipeline(&self) -> Result<&Pipeline, KmsError> {
        self.pipeline.as_ref().ok_or(KmsError::SessionDestroyed)
    }

    pub fn mode(&self) -> Option<&DrmModeInfo> {
        self.pipeline.as_ref().map(|p| p.mode.mode())
    }

    pub fn connector_name(&self) -> Option<&str> {
        self.pipeline.as_ref().map(|p| &*p.connector_name)
    }

    pub fn crtc(&self) -> Option<DrmCrtc> {
        self.pipeline.as_ref().map(|p| p.crtc)
    }

    pub fn format(&self) -> (Fourcc, Modifier) {
        (self.format, self.modifier)
    }

    /// Buffer objects presented through this session, cursor images included,
    /// must take their ids from here.
    pub fn dma_buf_ids(&self) -> &DmaBufIds {
        &self.dma_buf_ids
    }

    pub fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    pub fn is_pending(&self) -> bool {
        self.engine.is_pending()
    }

    pub fn buffer_state(&self, buffer: DmaBufId) -> Option<BufferState> {
        self.slots
            .iter()
            .find(|s| s.id() == buffer)
            .map(|s| s.public_state())
    }

    /// Allocates the scanout buffers, falling back to simpler layouts when the
    /// display rejects the configured one.
    fn allocate_pool(&mut self) -> Result<(), KmsError> {
        let pipeline = self.pipeline()?;
        let (width, height) = {
            let mode = pipeline.mode.mode();
            (mode.hdisplay as i32, mode.vdisplay as i32)
        };
        let primary = pipeline.primary;
        let mut candidates = vec![(self.config.format, self.config.modifier)];
        for c in [
            (self.config.format, LINEAR_MODIFIER),
            (XRGB8888, LINEAR_MODIFIER),
        ] {
            if !candidates.contains(&c) {
                candidates.push(c);
            }
        }
        self.slots.clear();
        let mut last_error = None;
        for (format, modifier) in candidates {
            if let Some(plane) = self.arena.plane(primary) {
                if !plane.supports_format(format) {
                    log::info!("Plane {} does not support format {}", primary, format);
                    continue;
                }
            }
            match self.try_allocate(width, height, format, modifier) {
                Ok(slots) => {
                    log::info!(
                        "Allocated {} scanout buffers ({}x{}, {}, modifier {:#x})",
                        slots.len(),
                        width,
                        height,
                        format,
                        modifier,
                    );
                    self.slots = slots;
                    self.format = format;
                    self.modifier = modifier;
                    return Ok(());
                }
                Err(e @ KmsError::ImportRejected { .. }) => {
                    log::warn!("Falling back to a simpler buffer layout: {}", ErrorFmt(&e));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(KmsError::NoPlane(
            self.pipeline()?.crtc.0,
            PlaneType::Primary,
        )))
    }

    fn try_allocate(
        &mut self,
        width: i32,
        height: i32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Vec<Slot>, KmsError> {
        let mut slots = Vec::with_capacity(POOL_DEPTH);
        for _ in 0..POOL_DEPTH {
            match self.allocate_slot(width, height, format, modifier) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        self.registrar.release(&slot.fb);
                    }
                    return Err(e);
                }
            }
        }
        Ok(slots)
    }

    fn allocate_slot(
        &mut self,
        width: i32,
        height: i32,
        format: Fourcc,
        modifier: Modifier,
    ) -> Result<Slot, KmsError> {
        let bo = self
            .allocator
            .create_bo(&self.dma_buf_ids, width, height, format, modifier)?;
        let fb = self.registrar.register(bo.dmabuf())?;
        Ok(Slot {
            bo,
            fb,
            state: SlotState::Free,
        })
    }

    /// Releases buffers whose out-fence has signaled.
    fn reap(&mut self) {
        for slot in &mut self.slots {
            if let SlotState::Retiring(Some(fence)) = &mut slot.state {
                match fence.poll() {
                    Ok(true) => slot.state = SlotState::Free,
                    Ok(false) => {}
                    Err(e) => {
                        log::warn!("Could not poll out-fence: {}", ErrorFmt(e));
                    }
                }
            }
        }
    }

    /// Returns a buffer the renderer may draw into.
    ///
    /// A buffer the display was reading is only returned after its out-fence
    /// signaled or, without out-fence support, after the next flip completed.
    pub fn acquire_render_target(&mut self) -> Result<Rc<dyn BufferObject>, KmsError> {
        self.pipeline()?;
        self.reap();
        if let Some(bo) = self.take_free() {
            return Ok(bo);
        }
        let timeout = self.config.fence_timeout;
        for slot in &mut self.slots {
            if let SlotState::Retiring(Some(fence)) = &mut slot.state {
                return match fence.wait(Some(timeout))? {
                    FenceStatus::Signaled => {
                        slot.state = SlotState::Rendering;
                        Ok(slot.bo.clone())
                    }
                    FenceStatus::TimedOut => Err(KmsError::FenceTimedOut),
                };
            }
        }
        let flip_needed = self
            .slots
            .iter()
            .any(|s| matches!(s.state, SlotState::Retiring(None)));
        if flip_needed && self.engine.is_pending() {
            self.wait_pending()?;
            if let Some(bo) = self.take_free() {
                return Ok(bo);
            }
        }
        Err(KmsError::NoFreeBuffer)
    }

    fn take_free(&mut self) -> Option<Rc<dyn BufferObject>> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s.state, SlotState::Free))?;
        slot.state = SlotState::Rendering;
        Some(slot.bo.clone())
    }

    /// Hands a rendered buffer to the display.
    ///
    /// The first frame after session start or a topology change is a blocking
    /// mode-set. Later frames are page flips and fail with `CommitBusy` while
    /// the previous flip is outstanding.
    pub fn present(
        &mut self,
        buffer: &Rc<dyn BufferObject>,
        gpu_fence: Option<Fence>,
    ) -> Result<CommitResult, KmsError> {
        let id = buffer.dmabuf().id;
        let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.id() == id && matches!(s.state, SlotState::Rendering))
        else {
            return Err(KmsError::NotRenderTarget(id));
        };
        if self.engine.is_pending() {
            return Err(KmsError::CommitBusy);
        }
        let fb = self.slots[idx].fb.clone();
        let blocking = self.config.blocking || !self.engine.modeset_done();
        self.build_frame(&fb, gpu_fence)?;
        let mut res = self.engine.commit(&*self.dev, &mut self.tx, blocking)?;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i == idx {
                slot.state = match blocking {
                    true => SlotState::Scanout,
                    false => SlotState::Queued,
                };
                continue;
            }
            if matches!(slot.state, SlotState::Free | SlotState::Rendering) {
                continue;
            }
            // A blocking commit has been applied once it returns.
            if blocking {
                slot.state = SlotState::Free;
            } else if matches!(slot.state, SlotState::Scanout) {
                slot.state = SlotState::Retiring(res.out_fence.take());
            }
        }
        if blocking {
            self.drop_retired(res.sequence);
        }
        Ok(res)
    }

    /// Resets the transaction and rebuilds every property of the display.
    fn build_frame(&mut self, fb: &Framebuffer, gpu_fence: Option<Fence>) -> Result<(), KmsError> {
        let Some(pipeline) = &self.pipeline else {
            return Err(KmsError::SessionDestroyed);
        };
        let arena = &self.arena;
        let connector = arena
            .connector(pipeline.connector)
            .ok_or(KmsError::ResourceUnavailable(pipeline.connector.0))?;
        let crtc = arena
            .crtc(pipeline.crtc)
            .ok_or(KmsError::ResourceUnavailable(pipeline.crtc.0))?;
        let primary = arena
            .plane(pipeline.primary)
            .ok_or(KmsError::ResourceUnavailable(pipeline.primary.0))?;
        let mode = pipeline.mode.mode();
        let tx = self.tx.begin();
        tx.set_connector_mode(connector, crtc, pipeline.mode.id());
        tx.set_crtc_active(crtc, true);
        let dmabuf_size = |bo: &dyn BufferObject| {
            let d = bo.dmabuf();
            Rect::new_sized(d.width as u32, d.height as u32)
        };
        let src = self
            .slots
            .iter()
            .find(|s| s.id() == fb.buffer())
            .map(|s| dmabuf_size(&*s.bo))
            .unwrap_or(Rect::new_sized(mode.hdisplay as u32, mode.vdisplay as u32));
        let dst = Rect::new_sized(mode.hdisplay as u32, mode.vdisplay as u32);
        tx.set_plane_properties(primary, fb, crtc.id, src, dst);
        if let Some(cursor_plane) = pipeline.cursor.and_then(|p| arena.plane(p)) {
            match &self.cursor {
                Some(cursor) => {
                    let src = dmabuf_size(&*cursor.image.buffer);
                    let dst = Rect {
                        x: cursor.image.x - cursor.image.hot_x,
                        y: cursor.image.y - cursor.image.hot_y,
                        ..src
                    };
                    tx.set_plane_properties(cursor_plane, &cursor.fb, crtc.id, src, dst);
                }
                None => tx.disable_plane(cursor_plane),
            }
        }
        if let Some(fence) = gpu_fence {
            attach_in_fence(tx, primary, fence, self.config.fence_timeout)?;
        }
        create_out_fence(tx, crtc);
        Ok(())
    }

    /// Blocks until the outstanding page flip completed.
    pub fn wait_pending(&mut self) -> Result<Option<FlipInfo>, KmsError> {
        let flip = self
            .engine
            .wait_pending(&*self.dev, Some(self.config.flip_timeout))?;
        if let Some(flip) = &flip {
            self.flip_completed(flip.sequence);
        }
        Ok(flip)
    }

    /// Delivers an event read by an external event loop.
    pub fn handle_event(&mut self, event: DrmEvent) -> Option<FlipInfo> {
        let flip = self.engine.handle_event(event);
        if let Some(flip) = &flip {
            self.flip_completed(flip.sequence);
        }
        flip
    }

    fn flip_completed(&mut self, sequence: u64) {
        for slot in &mut self.slots {
            match slot.state {
                SlotState::Queued => slot.state = SlotState::Scanout,
                SlotState::Retiring(None) => slot.state = SlotState::Free,
                _ => {}
            }
        }
        self.drop_retired(sequence);
        self.reap();
    }

    /// Removes the framebuffers that commit `sequence` no longer scans out.
    fn drop_retired(&mut self, sequence: u64) {
        self.retired.retain(|(seq, _)| *seq > sequence);
    }

    /// Keeps a framebuffer alive until a commit without it has been applied.
    fn retire(&mut self, fb: Rc<Framebuffer>) {
        self.registrar.release(&fb);
        self.retired.push((self.engine.next_sequence(), fb));
    }

    /// Sets or hides the cursor. Takes effect with the next presented frame.
    pub fn set_cursor(&mut self, image: Option<CursorImage>) -> Result<(), KmsError> {
        let (crtc, has_plane) = {
            let pipeline = self.pipeline()?;
            (pipeline.crtc, pipeline.cursor.is_some())
        };
        let Some(image) = image else {
            if let Some(old) = self.cursor.take() {
                self.retire(old.fb);
            }
            return Ok(());
        };
        if !has_plane {
            return Err(KmsError::NoPlane(crtc.0, PlaneType::Cursor));
        }
        let fb = self.registrar.register(image.buffer.dmabuf())?;
        if let Some(old) = self.cursor.take() {
            if old.fb.id() != fb.id() {
                self.retire(old.fb);
            }
        }
        self.cursor = Some(CursorState { image, fb });
        Ok(())
    }

    /// Re-discovers the display objects after a hot-plug notification.
    ///
    /// The next frame is a blocking mode-set. The buffer pool is reallocated
    /// if the mode size changed.
    pub fn handle_topology_change(&mut self) -> Result<(), KmsError> {
        self.pipeline()?;
        self.settle();
        self.arena.refresh(&*self.dev)?;
        let pipeline = select_pipeline(&self.dev, &mut self.arena, &self.config)?;
        let old_size = self
            .mode()
            .map(|m| (m.hdisplay, m.vdisplay))
            .unwrap_or_default();
        let new_size = {
            let m = pipeline.mode.mode();
            (m.hdisplay, m.vdisplay)
        };
        log::info!(
            "Display now driven through {} on CRTC {} with mode {}",
            pipeline.connector_name,
            pipeline.crtc,
            pipeline.mode.mode(),
        );
        self.engine.force_modeset(pipeline.crtc);
        self.pipeline = Some(pipeline);
        if old_size != new_size {
            let old: Vec<_> = self.slots.drain(..).collect();
            for slot in old {
                match slot.state {
                    SlotState::Free | SlotState::Rendering => self.registrar.release(&slot.fb),
                    _ => self.retire(slot.fb),
                }
            }
            self.allocate_pool()?;
        } else {
            // An abandoned flip may have reached the screen. The blocking
            // mode-set frees everything the display still holds.
            for slot in &mut self.slots {
                if matches!(slot.state, SlotState::Queued) {
                    slot.state = SlotState::Scanout;
                }
            }
        }
        if self.cursor.is_some() && self.pipeline()?.cursor.is_none() {
            log::warn!("The new CRTC has no cursor plane, hiding the cursor");
            self.set_cursor(None)?;
        }
        Ok(())
    }

    /// Waits for an outstanding flip with the flip timeout and gives up on it
    /// afterwards.
    fn settle(&mut self) {
        match self.wait_pending() {
            Ok(_) => {}
            Err(KmsError::FlipTimedOut) => self.engine.abandon_pending(),
            Err(e) => {
                log::error!("Could not wait for the pending flip: {}", ErrorFmt(e));
                self.engine.abandon_pending();
            }
        }
    }

    /// Tears the display down.
    ///
    /// The planes are disabled with a blocking commit before framebuffers and
    /// the mode blob are released.
    pub fn destroy_surface(&mut self) -> Result<(), KmsError> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        self.settle();
        let mut res = Ok(());
        let tx = self.tx.begin();
        for plane in [Some(pipeline.primary), pipeline.cursor].into_iter().flatten() {
            if let Some(p) = self.arena.plane(plane) {
                tx.disable_plane(p);
            }
        }
        if let Err(e) = self.engine.commit(&*self.dev, &mut self.tx, true) {
            log::error!("Could not disable the planes: {}", ErrorFmt(&e));
            res = Err(e);
        }
        self.tx.clear();
        self.cursor = None;
        self.retired.clear();
        self.slots.clear();
        self.registrar.clear();
        self.arena.free_plane(pipeline.primary);
        if let Some(cursor) = pipeline.cursor {
            self.arena.free_plane(cursor);
        }
        log::info!("Display on {} torn down", pipeline.connector_name);
        res
    }
}

impl Drop for DisplaySession {
    fn drop(&mut self) {
        if self.pipeline.is_some() {
            if let Err(e) = self.destroy_surface() {
                log::error!("Could not tear down the display: {}", ErrorFmt(e));
            }
        }
    }
}

fn select_pipeline(
    dev: &Rc<dyn KmsDevice>,
    arena: &mut ResourceArena,
    config: &SessionConfig,
) -> Result<Pipeline, KmsError> {
    let connector = match &config.connector {
        Some(name) => arena.connector_by_name(name).filter(|c| c.connected()),
        None => arena.connectors().find(|c| c.connected()),
    };
    let Some(connector) = connector else {
        return Err(KmsError::NoConnector);
    };
    let Some(crtc) = arena.crtc_for_connector(connector) else {
        return Err(KmsError::NoCrtc(connector.name.clone()));
    };
    let mode = match &config.mode {
        Some(req) => connector.modes.iter().find(|m| req.matches(m)),
        None => connector.modes.first(),
    };
    let Some(mode) = mode.cloned() else {
        return Err(KmsError::NoMode(connector.name.clone()));
    };
    let connector_id = connector.id;
    let connector_name = connector.name.clone();
    let primary = arena.setup_plane(crtc, PlaneType::Primary)?;
    let cursor = match config.cursor {
        false => None,
        true => match arena.setup_plane(crtc, PlaneType::Cursor) {
            Ok(p) => Some(p),
            Err(e) => {
                log::warn!("Running without a cursor plane: {}", ErrorFmt(e));
                None
            }
        },
    };
    let mode = match ModeBlob::new(dev, &mode) {
        Ok(m) => m,
        Err(e) => {
            arena.free_plane(primary);
            if let Some(c) = cursor {
                arena.free_plane(c);
            }
            return Err(KmsError::Device(e));
        }
    };
    log::info!(
        "Using connector {} on CRTC {} with mode {}",
        connector_name,
        crtc,
        mode.mode()
    );
    Ok(Pipeline {
        connector: connector_id,
        connector_name,
        crtc,
        primary,
        cursor,
        mode,
    })
}
