
use {
    crate::video::{Fourcc, LINEAR_MODIFIER, Modifier, XRGB8888, drm::DrmModeInfo},
    std::{
        fmt::{Display, Formatter},
        str::FromStr,
        time::Duration,
    },
    thiserror::Error,
};

/// The number of scanout buffers per display.
pub const POOL_DEPTH: usize = 2;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("Mode `{0}` is not of the form WxH or WxH@Hz")]
    InvalidMode(String),
    #[error("`{0}` is not a four character format code")]
    InvalidFormat(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connector name such as `HDMI-A-1`. The first connected one otherwise.
    pub connector: Option<String>,
    /// The preferred mode of the connector otherwise.
    pub mode: Option<ModeRequest>,
    pub format: Fourcc,
    pub modifier: Modifier,
    /// How long to wait for a buffer to be released by the display or for a
    /// GPU fence on planes without in-fence support.
    pub fence_timeout: Duration,
    pub flip_timeout: Duration,
    pub cursor: bool,
    /// Submit every frame with a blocking commit.
    pub blocking: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connector: None,
            mode: None,
            format: XRGB8888,
            modifier: LINEAR_MODIFIER,
            fence_timeout: Duration::from_millis(500),
            flip_timeout: Duration::from_secs(1),
            cursor: false,
            blocking: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ModeRequest {
    pub width: u16,
    pub height: u16,
    pub refresh_hz: Option<u32>,
}

impl ModeRequest {
    pub fn matches(&self, mode: &DrmModeInfo) -> bool {
        if mode.hdisplay != self.width || mode.vdisplay != self.height {
            return false;
        }
        match self.refresh_hz {
            None => true,
            Some(hz) => (mode.refresh_rate_millihz() + 500) / 1000 == hz,
        }
    }
}

impl FromStr for ModeRequest {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ConfigError::InvalidMode(s.to_string());
        let (size, refresh) = match s.split_once('@') {
            Some((size, refresh)) => (size, Some(refresh)),
            None => (s, None),
        };
        let (width, height) = size.split_once(['x', 'X']).ok_or_else(err)?;
        let width = width.trim().parse().map_err(|_| err())?;
        let height = height.trim().parse().map_err(|_| err())?;
        let refresh_hz = match refresh {
            Some(r) => Some(r.trim().parse().map_err(|_| err())?),
            None => None,
        };
        Ok(Self {
            width,
            height,
            refresh_hz,
        })
    }
}

impl Display for ModeRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)?;
        if let Some(hz) = self.refresh_hz {
            write!(f, "@{}", hz)?;
        }
        Ok(())
    }
}

pub fn parse_format(s: &str) -> Result<Fourcc, ConfigError> {
    Fourcc::parse(s).ok_or_else(|| ConfigError::InvalidFormat(s.to_string()))
}
