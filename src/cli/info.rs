use {
    crate::{
        cli::{GlobalArgs, InfoArgs},
        kms::resource::{PropertyTable, ResourceArena},
        utils::errorfmt::ErrorFmt,
        video::{
            Fourcc,
            drm::{
                DrmMaster, DrmPropertyType,
                sys::{DRM_CAP_CURSOR_HEIGHT, DRM_CAP_CURSOR_WIDTH, DRM_CAP_DUMB_BUFFER},
            },
        },
    },
    std::fmt::Write,
};

pub fn main(global: GlobalArgs, args: InfoArgs) {
    let drm = match DrmMaster::open(&global.device) {
        Ok(d) => d,
        Err(e) => fatal!("Could not open {}: {}", global.device, ErrorFmt(e)),
    };
    let arena = match ResourceArena::discover_all(&*drm) {
        Ok(a) => a,
        Err(e) => fatal!("Could not discover the display objects: {}", ErrorFmt(e)),
    };
    println!("Device {}", drm.path());
    let cap = |cap| match drm.get_cap(cap) {
        Ok(v) => v.to_string(),
        Err(e) => format!("unknown ({})", ErrorFmt(e)),
    };
    println!("    Dumb buffers: {}", cap(DRM_CAP_DUMB_BUFFER));
    println!(
        "    Cursor size: {}x{}",
        cap(DRM_CAP_CURSOR_WIDTH),
        cap(DRM_CAP_CURSOR_HEIGHT)
    );
    for connector in arena.connectors() {
        let mut line = format!("Connector {} (id {}): ", connector.name, connector.id);
        match connector.connected() {
            true => {
                let _ = write!(
                    line,
                    "connected, {}x{} mm",
                    connector.mm_width, connector.mm_height
                );
            }
            false => line.push_str("disconnected"),
        }
        println!("{}", line);
        let crtcs: Vec<_> = arena
            .crtcs()
            .filter(|c| connector.possible_crtcs & (1 << c.idx) != 0)
            .map(|c| c.id.to_string())
            .collect();
        println!("    CRTCs: {}", crtcs.join(", "));
        if let Some(crtc) = connector.current_crtc {
            println!("    Active on CRTC {}", crtc);
        }
        let modes = match args.modes {
            true => &connector.modes[..],
            false => &connector.modes[..connector.modes.len().min(1)],
        };
        for mode in modes {
            let preferred = if mode.is_preferred() { " (preferred)" } else { "" };
            println!("    Mode {}{}", mode, preferred);
        }
        if args.props {
            print_props(&connector.table);
        }
    }
    for crtc in arena.crtcs() {
        let out_fences = match crtc.props.out_fence_ptr {
            Some(_) => "out-fences",
            None => "no out-fences",
        };
        println!("CRTC {} (index {}): {}", crtc.id, crtc.idx, out_fences);
        if args.props {
            print_props(&crtc.table);
        }
    }
    for plane in arena.planes() {
        let crtcs: Vec<_> = arena
            .crtcs()
            .filter(|c| plane.supports_crtc(c))
            .map(|c| c.id.to_string())
            .collect();
        let in_fences = match plane.props.in_fence_fd {
            Some(_) => "in-fences",
            None => "no in-fences",
        };
        println!(
            "Plane {}: {}, CRTCs {}, {}",
            plane.id,
            plane.ty,
            crtcs.join(", "),
            in_fences
        );
        let formats: Vec<_> = plane
            .formats
            .iter()
            .map(|f| Fourcc(*f).to_string())
            .collect();
        println!("    Formats: {}", formats.join(" "));
        if args.props {
            print_props(&plane.table);
        }
    }
}

fn print_props(table: &PropertyTable) {
    for (name, prop) in table.iter() {
        let def = &prop.definition;
        let value = match &def.ty {
            DrmPropertyType::Enum { bitmask: false, .. } => match def.ty.enum_name(prop.value) {
                Some(n) => n.to_string(),
                None => prop.value.to_string(),
            },
            DrmPropertyType::SignedRange { .. } => (prop.value as i64).to_string(),
            _ => prop.value.to_string(),
        };
        let ro = if def.immutable { " (immutable)" } else { "" };
        println!("    {} = {}{}", name, value, ro);
    }
}
