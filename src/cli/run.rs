use {
    crate::{
        allocator::{Allocator, AllocatorError, BufferObject},
        cli::{GlobalArgs, RunArgs},
        config::SessionConfig,
        kms::{
            KmsError,
            session::{CursorImage, DisplaySession},
        },
        utils::errorfmt::ErrorFmt,
        video::{
            ABGR8888, ARGB8888, Fourcc, LINEAR_MODIFIER, XBGR8888,
            drm::{DrmError, DrmMaster},
            dumb::DumbAllocator,
        },
    },
    std::{rc::Rc, time::Instant},
    thiserror::Error,
};

const CURSOR_SIZE: i32 = 64;

#[derive(Debug, Error)]
enum RunError {
    #[error("Could not open the device")]
    Open(#[source] DrmError),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error("Could not create the cursor image")]
    Cursor(#[source] AllocatorError),
    #[error("Could not map a buffer")]
    Map(#[source] AllocatorError),
}

pub fn main(global: GlobalArgs, args: RunArgs) {
    if let Err(e) = run(&global.device, args) {
        fatal!("Could not run the display: {}", ErrorFmt(e));
    }
}

fn run(device: &str, args: RunArgs) -> Result<(), RunError> {
    let drm = DrmMaster::open(device).map_err(RunError::Open)?;
    let allocator = Rc::new(DumbAllocator::new(&drm));
    let config = SessionConfig {
        connector: args.connector,
        mode: args.mode,
        format: args.format,
        fence_timeout: args.fence_timeout,
        flip_timeout: args.flip_timeout,
        cursor: args.cursor,
        blocking: args.blocking,
        ..Default::default()
    };
    let mut session = DisplaySession::new(drm.clone(), allocator.clone(), config)?;
    let (width, height) = match session.mode() {
        Some(m) => (m.hdisplay as i32, m.vdisplay as i32),
        None => return Err(KmsError::SessionDestroyed.into()),
    };
    let cursor = match args.cursor {
        true => Some(create_cursor(&*allocator, &session)?),
        false => None,
    };
    let (format, _) = session.format();
    let start = Instant::now();
    for frame in 0..args.frames {
        if session.is_pending() {
            session.wait_pending()?;
        }
        let bo = session.acquire_render_target()?;
        draw_frame(&bo, format, frame).map_err(RunError::Map)?;
        if let Some(cursor) = &cursor {
            let pos = (frame as i32 * 8) % (width + height).max(1);
            session.set_cursor(Some(CursorImage {
                buffer: cursor.clone(),
                x: pos.min(width - 1),
                y: (pos - width).max(0),
                hot_x: 0,
                hot_y: 0,
            }))?;
        }
        let res = session.present(&bo, None)?;
        log::trace!("Presented frame {} as commit {}", frame, res.sequence);
    }
    if session.is_pending() {
        session.wait_pending()?;
    }
    let elapsed = start.elapsed();
    log::info!(
        "Presented {} frames in {}",
        args.frames,
        humantime::format_duration(elapsed)
    );
    session.destroy_surface()?;
    Ok(())
}

fn create_cursor(
    allocator: &dyn Allocator,
    session: &DisplaySession,
) -> Result<Rc<dyn BufferObject>, RunError> {
    let bo = allocator
        .create_bo(
            session.dma_buf_ids(),
            CURSOR_SIZE,
            CURSOR_SIZE,
            ARGB8888,
            LINEAR_MODIFIER,
        )
        .map_err(RunError::Cursor)?;
    let mut map = bo.clone().map_write().map_err(RunError::Cursor)?;
    let stride = map.stride() as usize;
    let data = map.data_mut();
    let size = CURSOR_SIZE as usize;
    for y in 0..size {
        for x in 0..size {
            let border = x < 2 || y < 2 || x >= size - 2 || y >= size - 2;
            let v = if border { 0x00 } else { 0xff };
            let off = y * stride + x * 4;
            data[off..off + 4].copy_from_slice(&[v, v, v, 0xff]);
        }
    }
    Ok(bo)
}

/// Fills the buffer with a horizontal hue gradient that moves with `frame`.
fn draw_frame(
    bo: &Rc<dyn BufferObject>,
    format: Fourcc,
    frame: u64,
) -> Result<(), AllocatorError> {
    let dmabuf = bo.dmabuf();
    let (width, height) = (dmabuf.width as usize, dmabuf.height as usize);
    let mut map = bo.clone().map_write()?;
    let stride = map.stride() as usize;
    let swap = format == XBGR8888 || format == ABGR8888;
    let mut row = Vec::with_capacity(width * 4);
    for x in 0..width {
        let (r, g, b) = hue(((x as u64 + frame * 4) % 768) as u32);
        let px = match swap {
            true => [r, g, b, 0xff],
            false => [b, g, r, 0xff],
        };
        row.extend_from_slice(&px);
    }
    let data = map.data_mut();
    for y in 0..height {
        let off = y * stride;
        data[off..off + row.len()].copy_from_slice(&row);
    }
    Ok(())
}

fn hue(h: u32) -> (u8, u8, u8) {
    let f = (h % 256) as u8;
    match h / 256 {
        0 => (255 - f, f, 0),
        1 => (0, 255 - f, f),
        _ => (f, 0, 255 - f),
    }
}
