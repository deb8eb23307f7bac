use {
    crate::{
        allocator::BufferObject,
        config::SessionConfig,
        kms::{
            KmsError,
            device::KmsDevice,
            session::{BufferState, CursorImage, DisplaySession},
            test_device::{
                CRTC_A, CURSOR_A, DP, HDMI, PRIMARY_A, TestAllocator, TestBo, TestDevice,
                TestDeviceConfig, gpu_fence,
            },
        },
        video::{
            LINEAR_MODIFIER, XRGB8888, dmabuf::DmaBufIds, drm::sys::DRM_MODE_ATOMIC_ALLOW_MODESET,
        },
    },
    std::{rc::Rc, time::Duration},
    uapi::c,
};

const TILED: u64 = 0x0100_0000_0000_0001;

fn config() -> SessionConfig {
    SessionConfig {
        fence_timeout: Duration::from_millis(10),
        flip_timeout: Duration::from_millis(10),
        cursor: true,
        ..Default::default()
    }
}

fn session_with(
    dev_config: TestDeviceConfig,
    config: SessionConfig,
) -> (Rc<TestDevice>, Rc<TestAllocator>, DisplaySession) {
    let dev = TestDevice::new(dev_config);
    let allocator = Rc::new(TestAllocator::default());
    let session = DisplaySession::new(dev.clone(), allocator.clone(), config).unwrap();
    (dev, allocator, session)
}

fn session() -> (Rc<TestDevice>, Rc<TestAllocator>, DisplaySession) {
    session_with(TestDeviceConfig::default(), config())
}

fn state(session: &DisplaySession, bo: &Rc<dyn BufferObject>) -> BufferState {
    session.buffer_state(bo.dmabuf().id).unwrap()
}

fn cursor_image(session: &DisplaySession) -> CursorImage {
    CursorImage {
        buffer: TestBo::new(session.dma_buf_ids(), 64, 64, XRGB8888, LINEAR_MODIFIER),
        x: 10,
        y: 10,
        hot_x: 0,
        hot_y: 0,
    }
}

fn is_removed(dev: &TestDevice, fb: u64) -> bool {
    dev.removed_fbs().iter().any(|f| f.0 as u64 == fb)
}

#[test]
fn selects_pipeline() {
    let (dev, allocator, session) = session();
    assert_eq!(session.connector_name(), Some("HDMI-A-1"));
    assert_eq!(session.crtc(), Some(CRTC_A));
    let mode = session.mode().unwrap();
    assert_eq!((mode.hdisplay, mode.vdisplay), (1920, 1080));
    assert_eq!(session.format(), (XRGB8888, LINEAR_MODIFIER));
    assert_eq!(allocator.allocated.get(), 2);
    assert_eq!(dev.live_fbs(), 2);
    assert_eq!(dev.live_blobs(), 1);
    assert!(dev.commits().is_empty());
}

#[test]
fn requested_mode_and_connector() {
    let (_, _, session) = session_with(
        TestDeviceConfig::default(),
        SessionConfig {
            connector: Some("hdmi-a-1".to_string()),
            mode: Some("1280x720".parse().unwrap()),
            ..config()
        },
    );
    let mode = session.mode().unwrap();
    assert_eq!((mode.hdisplay, mode.vdisplay), (1280, 720));
}

#[test]
fn unusable_configurations() {
    let dev = TestDevice::new(TestDeviceConfig::default());
    let allocator = Rc::new(TestAllocator::default());
    let new = |config| DisplaySession::new(dev.clone(), allocator.clone(), config);
    let res = new(SessionConfig {
        connector: Some("DP-1".to_string()),
        ..config()
    });
    assert!(matches!(res, Err(KmsError::NoConnector)));
    let res = new(SessionConfig {
        mode: Some("800x600".parse().unwrap()),
        ..config()
    });
    assert!(matches!(res, Err(KmsError::NoMode(_))));
    dev.set_connected(HDMI, false);
    assert!(matches!(new(config()), Err(KmsError::NoConnector)));
    assert_eq!(dev.live_blobs(), 0);
}

#[test]
fn first_frame_is_a_modeset() {
    let (dev, _, mut session) = session();
    let bo = session.acquire_render_target().unwrap();
    assert_eq!(state(&session, &bo), BufferState::Rendering);
    let res = session.present(&bo, None).unwrap();
    assert!(res.blocking);
    assert!(!session.is_pending());
    assert_eq!(state(&session, &bo), BufferState::Scanout);

    let commit = dev.last_commit();
    assert_eq!(commit.flags, DRM_MODE_ATOMIC_ALLOW_MODESET);
    assert_eq!(commit.value(HDMI.0, dev.prop("CRTC_ID")), Some(CRTC_A.0 as u64));
    assert!(commit.value(CRTC_A.0, dev.prop("MODE_ID")).is_some());
    assert_eq!(commit.value(CRTC_A.0, dev.prop("ACTIVE")), Some(1));
    assert!(commit.value(PRIMARY_A.0, dev.prop("FB_ID")).unwrap() != 0);
    assert_eq!(commit.value(PRIMARY_A.0, dev.prop("SRC_W")), Some(1920 << 16));
    assert_eq!(commit.value(PRIMARY_A.0, dev.prop("CRTC_H")), Some(1080));
    assert_eq!(commit.value(CURSOR_A.0, dev.prop("FB_ID")), Some(0));
    assert!(commit.out_fence);
}

#[test]
fn page_flips_are_gated_by_out_fences() {
    let (dev, _, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();

    let b = session.acquire_render_target().unwrap();
    let (fence, _fd) = gpu_fence();
    let res = session.present(&b, Some(fence)).unwrap();
    assert!(!res.blocking);
    assert!(res.out_fence.is_none());
    assert!(session.is_pending());
    assert_eq!(state(&session, &a), BufferState::Retiring);
    assert_eq!(state(&session, &b), BufferState::Queued);
    let commit = dev.last_commit();
    assert!(commit.is_nonblocking());
    assert!(commit.value(PRIMARY_A.0, dev.prop("IN_FENCE_FD")).is_some());

    assert!(matches!(
        session.acquire_render_target(),
        Err(KmsError::FenceTimedOut)
    ));
    assert!(matches!(
        session.present(&b, None),
        Err(KmsError::NotRenderTarget(_))
    ));

    dev.signal_out_fence(1);
    let a2 = session.acquire_render_target().unwrap();
    assert!(Rc::ptr_eq(&a, &a2));
    assert!(matches!(
        session.present(&a2, None),
        Err(KmsError::CommitBusy)
    ));

    let flip = session.wait_pending().unwrap().unwrap();
    assert_eq!(flip.sequence, res.sequence);
    assert_eq!(state(&session, &b), BufferState::Scanout);
    let res = session.present(&a2, None).unwrap();
    assert!(!res.blocking);
    assert_eq!(state(&session, &b), BufferState::Retiring);
}

#[test]
fn flips_release_buffers_without_out_fences() {
    let (dev, _, mut session) = session_with(
        TestDeviceConfig {
            out_fences: false,
            ..Default::default()
        },
        config(),
    );
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    let b = session.acquire_render_target().unwrap();
    session.present(&b, None).unwrap();
    assert!(!dev.last_commit().out_fence);
    assert_eq!(state(&session, &a), BufferState::Retiring);

    // the pending flip is awaited
    let a2 = session.acquire_render_target().unwrap();
    assert!(Rc::ptr_eq(&a, &a2));
    assert!(!session.is_pending());
    assert_eq!(state(&session, &b), BufferState::Scanout);

    dev.hold_flips(true);
    session.present(&a2, None).unwrap();
    assert!(matches!(
        session.acquire_render_target(),
        Err(KmsError::FlipTimedOut)
    ));
}

#[test]
fn rejected_page_flip_changes_nothing() {
    let (dev, _, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    let b = session.acquire_render_target().unwrap();
    let commits = dev.commits().len();

    dev.reject_next_commit(c::EINVAL);
    match session.present(&b, None) {
        Err(KmsError::AtomicCommitRejected(e)) => assert_eq!(e.0, c::EINVAL),
        r => panic!("unexpected result: {:?}", r),
    }
    assert_eq!(dev.commits().len(), commits);
    assert!(!session.is_pending());
    assert_eq!(state(&session, &a), BufferState::Scanout);
    assert_eq!(state(&session, &b), BufferState::Rendering);
    assert_eq!(dev.live_fbs(), 2);

    let res = session.present(&b, None).unwrap();
    assert!(!res.blocking);
    assert!(session.is_pending());
    assert_eq!(state(&session, &a), BufferState::Retiring);
    assert_eq!(state(&session, &b), BufferState::Queued);
    let commit = dev.last_commit();
    assert!(commit.is_nonblocking());
    assert!(commit.value(PRIMARY_A.0, dev.prop("FB_ID")).unwrap() != 0);
}

#[test]
fn externally_read_events() {
    let (dev, _, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    let b = session.acquire_render_target().unwrap();
    let res = session.present(&b, None).unwrap();
    let event = dev.next_event(None).unwrap().unwrap();
    let flip = session.handle_event(event).unwrap();
    assert_eq!(flip.sequence, res.sequence);
    assert_eq!(state(&session, &b), BufferState::Scanout);
    assert!(session.handle_event(event).is_none());
}

#[test]
fn foreign_buffers_are_rejected() {
    let (_, _, mut session) = session();
    let ids = DmaBufIds::default();
    ids.next();
    ids.next();
    let foreign: Rc<dyn BufferObject> = TestBo::new(&ids, 1920, 1080, XRGB8888, LINEAR_MODIFIER);
    assert!(matches!(
        session.present(&foreign, None),
        Err(KmsError::NotRenderTarget(_))
    ));
    let a = session.acquire_render_target().unwrap();
    let b = session.acquire_render_target().unwrap();
    assert!(matches!(
        session.acquire_render_target(),
        Err(KmsError::NoFreeBuffer)
    ));
    session.present(&b, None).unwrap();
    session.present(&a, None).unwrap();
}

#[test]
fn format_fallback() {
    let dev = TestDevice::new(TestDeviceConfig::default());
    dev.reject_modifier(TILED);
    let allocator = Rc::new(TestAllocator::default());
    let session = DisplaySession::new(
        dev.clone(),
        allocator.clone(),
        SessionConfig {
            modifier: TILED,
            ..config()
        },
    )
    .unwrap();
    assert_eq!(session.format(), (XRGB8888, LINEAR_MODIFIER));
    assert_eq!(dev.live_fbs(), 2);
    assert_eq!(allocator.allocated.get(), 3);

    dev.reject_format(XRGB8888);
    let res = DisplaySession::new(dev.clone(), allocator.clone(), config());
    assert!(matches!(res, Err(KmsError::ImportRejected { .. })));
}

#[test]
fn cursor_plane() {
    let (dev, _, mut session) = session_with(
        TestDeviceConfig::default(),
        SessionConfig {
            blocking: true,
            ..config()
        },
    );
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();

    let image = TestBo::new(session.dma_buf_ids(), 64, 64, XRGB8888, LINEAR_MODIFIER);
    session
        .set_cursor(Some(CursorImage {
            buffer: image,
            x: 100,
            y: 50,
            hot_x: 4,
            hot_y: 2,
        }))
        .unwrap();
    assert_eq!(dev.live_fbs(), 3);
    let b = session.acquire_render_target().unwrap();
    let res = session.present(&b, None).unwrap();
    assert!(res.blocking);
    assert_eq!(state(&session, &a), BufferState::Free);
    let commit = dev.last_commit();
    assert!(commit.value(CURSOR_A.0, dev.prop("FB_ID")).unwrap() != 0);
    assert_eq!(commit.value(CURSOR_A.0, dev.prop("CRTC_X")), Some(96));
    assert_eq!(commit.value(CURSOR_A.0, dev.prop("CRTC_Y")), Some(48));
    assert_eq!(commit.value(CURSOR_A.0, dev.prop("CRTC_W")), Some(64));

    session.set_cursor(None).unwrap();
    // still scanned out until the next commit
    assert_eq!(dev.live_fbs(), 3);
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    assert_eq!(dev.live_fbs(), 2);
    let commit = dev.last_commit();
    assert_eq!(commit.value(CURSOR_A.0, dev.prop("FB_ID")), Some(0));
}

#[test]
fn replaced_cursor_stays_until_its_flip_completed() {
    let (dev, _, mut session) = session();
    session.set_cursor(Some(cursor_image(&session))).unwrap();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    let b = session.acquire_render_target().unwrap();
    session.present(&b, None).unwrap();
    assert!(session.is_pending());
    let old_cursor = dev.last_commit().value(CURSOR_A.0, dev.prop("FB_ID")).unwrap();

    // the pending flip still shows the old cursor
    session.set_cursor(Some(cursor_image(&session))).unwrap();
    session.wait_pending().unwrap().unwrap();
    assert!(!is_removed(&dev, old_cursor));

    dev.signal_out_fence(1);
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    let new_cursor = dev.last_commit().value(CURSOR_A.0, dev.prop("FB_ID")).unwrap();
    assert_ne!(new_cursor, old_cursor);
    assert!(!is_removed(&dev, old_cursor));
    session.wait_pending().unwrap().unwrap();
    assert!(is_removed(&dev, old_cursor));
    assert!(!is_removed(&dev, new_cursor));
}

#[test]
fn cursor_without_plane() {
    let (_, _, mut session) = session_with(
        TestDeviceConfig {
            cursor_plane: false,
            ..Default::default()
        },
        config(),
    );
    let image = TestBo::new(session.dma_buf_ids(), 64, 64, XRGB8888, LINEAR_MODIFIER);
    let res = session.set_cursor(Some(CursorImage {
        buffer: image,
        x: 0,
        y: 0,
        hot_x: 0,
        hot_y: 0,
    }));
    assert!(matches!(res, Err(KmsError::NoPlane(..))));
    session.set_cursor(None).unwrap();
}

#[test]
fn topology_change() {
    let (dev, allocator, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    let b = session.acquire_render_target().unwrap();
    session.present(&b, None).unwrap();

    dev.set_connected(HDMI, false);
    dev.set_connected(DP, true);
    session.handle_topology_change().unwrap();
    assert!(!session.is_pending());
    assert_eq!(session.connector_name(), Some("DP-1"));
    assert_eq!(session.crtc(), Some(CRTC_A));
    let mode = session.mode().unwrap();
    assert_eq!((mode.hdisplay, mode.vdisplay), (2560, 1440));
    assert_eq!(allocator.allocated.get(), 4);
    // the old buffers stay registered until the mode-set replaced them
    assert_eq!(dev.live_fbs(), 4);
    assert_eq!(dev.live_blobs(), 1);

    let c = session.acquire_render_target().unwrap();
    assert_eq!(c.dmabuf().width, 2560);
    let res = session.present(&c, None).unwrap();
    assert!(res.blocking);
    assert_eq!(dev.live_fbs(), 2);
    let commit = dev.last_commit();
    assert_eq!(commit.value(DP.0, dev.prop("CRTC_ID")), Some(CRTC_A.0 as u64));
}

#[test]
fn topology_change_keeps_pool_of_same_size() {
    let (dev, allocator, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    session.handle_topology_change().unwrap();
    assert_eq!(allocator.allocated.get(), 2);
    // the CRTC keeps showing the buffer until the mode-set
    assert_eq!(state(&session, &a), BufferState::Scanout);
    let b = session.acquire_render_target().unwrap();
    assert!(!Rc::ptr_eq(&a, &b));
    assert!(matches!(
        session.acquire_render_target(),
        Err(KmsError::NoFreeBuffer)
    ));
    assert!(session.present(&b, None).unwrap().blocking);
    assert_eq!(state(&session, &a), BufferState::Free);
    assert_eq!(dev.live_blobs(), 1);
}

#[test]
fn failed_rediscovery_keeps_the_display() {
    let (dev, _, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();

    dev.fail_property_queries(c::EIO);
    assert!(matches!(
        session.handle_topology_change(),
        Err(KmsError::PropertyQueryFailed { .. })
    ));
    assert_eq!(session.connector_name(), Some("HDMI-A-1"));
    assert!(session.arena().connector(HDMI).is_some());
    assert!(session.arena().plane(PRIMARY_A).is_some());

    let b = session.acquire_render_target().unwrap();
    let res = session.present(&b, None).unwrap();
    assert!(!res.blocking);
    let commit = dev.last_commit();
    assert_eq!(commit.value(HDMI.0, dev.prop("CRTC_ID")), Some(CRTC_A.0 as u64));
    assert!(commit.value(PRIMARY_A.0, dev.prop("FB_ID")).unwrap() != 0);
}

#[test]
fn destroy_surface() {
    let (dev, _, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    let b = session.acquire_render_target().unwrap();
    session.present(&b, None).unwrap();
    session.destroy_surface().unwrap();

    let commit = dev.last_commit();
    assert!(!commit.is_nonblocking());
    assert_eq!(commit.value(PRIMARY_A.0, dev.prop("FB_ID")), Some(0));
    assert_eq!(commit.value(PRIMARY_A.0, dev.prop("CRTC_ID")), Some(0));
    assert_eq!(commit.value(CURSOR_A.0, dev.prop("FB_ID")), Some(0));
    drop(a);
    drop(b);
    assert_eq!(dev.live_fbs(), 0);
    assert_eq!(dev.live_blobs(), 0);
    assert!(session.mode().is_none());
    assert!(matches!(
        session.acquire_render_target(),
        Err(KmsError::SessionDestroyed)
    ));
    let commits = dev.commits().len();
    session.destroy_surface().unwrap();
    drop(session);
    assert_eq!(dev.commits().len(), commits);
}

#[test]
fn drop_tears_down() {
    let (dev, _, mut session) = session();
    let a = session.acquire_render_target().unwrap();
    session.present(&a, None).unwrap();
    drop(session);
    assert_eq!(dev.live_fbs(), 0);
    assert_eq!(dev.live_blobs(), 0);
    assert_eq!(dev.last_commit().value(PRIMARY_A.0, dev.prop("FB_ID")), Some(0));
}
