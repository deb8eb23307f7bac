mod info;
mod run;

use {
    crate::{
        config::{ModeRequest, parse_format},
        logger::Logger,
        video::Fourcc,
    },
    ::log::Level,
    clap::{Args, Parser, Subcommand, ValueEnum},
    std::time::Duration,
};

/// Drives a display through atomic mode setting.
#[derive(Parser, Debug)]
#[command(version)]
struct KmsPresent {
    #[clap(flatten)]
    global: GlobalArgs,
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// The log level.
    #[arg(value_enum, long, default_value_t)]
    pub log_level: CliLogLevel,
    /// The DRM device to open.
    #[arg(long, global = true, default_value = "/dev/dri/card0")]
    pub device: String,
    /// Write the log to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

impl GlobalArgs {
    fn install_logger(&self) {
        let level = self.log_level.into();
        match &self.log_file {
            Some(path) => Logger::install_file(level, path),
            None => Logger::install_stderr(level),
        };
    }
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print the connectors, CRTCs and planes of the device.
    Info(InfoArgs),
    /// Show a test pattern on a display.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Show all modes of each connector.
    #[arg(long)]
    pub modes: bool,
    /// Show the property tables of all objects.
    #[arg(long)]
    pub props: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// The number of frames to present.
    #[arg(long, default_value_t = 300)]
    pub frames: u64,
    /// Submit every frame with a blocking commit instead of a page flip.
    #[arg(long)]
    pub blocking: bool,
    /// The connector to use, e.g. HDMI-A-1.
    ///
    /// By default the first connected connector is used.
    #[arg(long)]
    pub connector: Option<String>,
    /// The mode to use, e.g. 1920x1080 or 1920x1080@60.
    ///
    /// By default the preferred mode of the connector is used.
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<ModeRequest>,
    /// The scanout format as a four character code.
    #[arg(long, value_parser = parse_fourcc, default_value = "XR24")]
    pub format: Fourcc,
    /// Show a cursor that moves across the screen.
    #[arg(long)]
    pub cursor: bool,
    /// How long to wait for the display to release a buffer.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
    pub fence_timeout: Duration,
    /// How long to wait for a page flip to complete.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    pub flip_timeout: Duration,
}

fn parse_mode(s: &str) -> Result<ModeRequest, String> {
    s.parse().map_err(|e: crate::config::ConfigError| e.to_string())
}

fn parse_fourcc(s: &str) -> Result<Fourcc, String> {
    parse_format(s).map_err(|e| e.to_string())
}

#[derive(ValueEnum, Debug, Copy, Clone, Hash, Default)]
pub enum CliLogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<CliLogLevel> for Level {
    fn from(l: CliLogLevel) -> Self {
        match l {
            CliLogLevel::Trace => Level::Trace,
            CliLogLevel::Debug => Level::Debug,
            CliLogLevel::Info => Level::Info,
            CliLogLevel::Warn => Level::Warn,
            CliLogLevel::Error => Level::Error,
        }
    }
}

pub fn main() {
    let cli = KmsPresent::parse();
    cli.global.install_logger();
    match cli.command {
        Cmd::Info(a) => info::main(cli.global, a),
        Cmd::Run(a) => run::main(cli.global, a),
    }
}
