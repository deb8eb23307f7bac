use std::fmt::{Debug, Display, Formatter};

pub mod dmabuf;
pub mod drm;
pub mod dumb;

pub type Modifier = u64;

pub const INVALID_MODIFIER: Modifier = 0x00ff_ffff_ffff_ffff;
pub const LINEAR_MODIFIER: Modifier = 0;

/// A DRM fourcc pixel format code.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Fourcc(pub u32);

pub const XRGB8888: Fourcc = Fourcc::from_bytes(*b"XR24");
pub const ARGB8888: Fourcc = Fourcc::from_bytes(*b"AR24");
pub const XBGR8888: Fourcc = Fourcc::from_bytes(*b"XB24");
pub const ABGR8888: Fourcc = Fourcc::from_bytes(*b"AB24");

impl Fourcc {
    pub const fn from_bytes(b: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(b))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let b: [u8; 4] = s.as_bytes().try_into().ok()?;
        Some(Self::from_bytes(b))
    }

    pub fn bpp(self) -> Option<u32> {
        match self {
            XRGB8888 | ARGB8888 | XBGR8888 | ABGR8888 => Some(32),
            _ => None,
        }
    }
}

impl Display for Fourcc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0.to_le_bytes() {
            let c = if b.is_ascii_graphic() { b as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl Debug for Fourcc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#010x})", self, self.0)
    }
}
