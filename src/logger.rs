
use {
    crate::utils::{errorfmt::ErrorFmt, oserror::OsError},
    backtrace::Backtrace,
    log::{Level, Log, Metadata, Record},
    std::{
        cell::RefCell,
        io::Write,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering::Relaxed},
        },
        time::SystemTime,
    },
    uapi::{Fd, OwnedFd, c},
};

thread_local! {
    static BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

pub struct Logger {
    level: AtomicU32,
    file: OwnedFd,
}

impl Logger {
    /// Logs to a duplicate of stderr.
    pub fn install_stderr(level: Level) -> Arc<Self> {
        let file = match uapi::fcntl_dupfd_cloexec(2, 0) {
            Ok(fd) => fd,
            Err(e) => {
                let e = OsError::from(e);
                eprintln!("Error: Could not dup stderr: {}", ErrorFmt(e));
                std::process::exit(1);
            }
        };
        Self::install(level, file)
    }

    /// Logs to `path`, replacing its previous contents.
    pub fn install_file(level: Level, path: &str) -> Arc<Self> {
        let file = match uapi::open(
            path,
            c::O_CREAT | c::O_TRUNC | c::O_CLOEXEC | c::O_WRONLY,
            0o644,
        ) {
            Ok(fd) => fd,
            Err(e) => {
                let e = OsError::from(e);
                eprintln!("Error: Could not open log file {}: {}", path, ErrorFmt(e));
                std::process::exit(1);
            }
        };
        Self::install(level, file)
    }

    /// Installs the logger and routes panics through it.
    fn install(level: Level, file: OwnedFd) -> Arc<Self> {
        std::panic::set_hook(Box::new(|p| {
            if let Some(loc) = p.location() {
                log::error!(
                    "Panic at {} line {} column {}",
                    loc.file(),
                    loc.line(),
                    loc.column()
                );
            } else {
                log::error!("Panic at unknown location");
            }
            if let Some(msg) = p.payload().downcast_ref::<&str>() {
                log::error!("Message: {}", msg);
            }
            if let Some(msg) = p.payload().downcast_ref::<String>() {
                log::error!("Message: {}", msg);
            }
            log::error!("Backtrace:\n{:?}", Backtrace::new());
        }));
        let slf = Arc::new(Self {
            level: AtomicU32::new(level as _),
            file,
        });
        let res = log::set_boxed_logger(Box::new(LogWrapper {
            logger: slf.clone(),
        }));
        if res.is_ok() {
            log::set_max_level(level.to_level_filter());
        }
        slf
    }

    pub fn set_level(&self, level: Level) {
        self.level.store(level as _, Relaxed);
        log::set_max_level(level.to_level_filter());
    }
}

/// Formats one log line. Records from this crate drop the crate prefix.
fn format_record(buffer: &mut Vec<u8>, record: &Record, now: SystemTime) {
    let time = humantime::format_rfc3339_millis(now);
    let module = record
        .module_path()
        .map(|mp| mp.strip_prefix("kms_present::").unwrap_or(mp));
    let _ = match module {
        Some(mp) => writeln!(
            buffer,
            "[{} {:5} {}] {}",
            time,
            record.level(),
            mp,
            record.args(),
        ),
        None => writeln!(buffer, "[{} {:5}] {}", time, record.level(), record.args()),
    };
}

struct LogWrapper {
    logger: Arc<Logger>,
}

impl Log for LogWrapper {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as u32 <= self.logger.level.load(Relaxed)
    }

    fn log(&self, record: &Record) {
        if record.level() as u32 > self.logger.level.load(Relaxed) {
            return;
        }
        BUFFER.with_borrow_mut(|buffer| {
            buffer.clear();
            format_record(buffer, record, SystemTime::now());
            let mut fd = Fd::new(self.logger.file.raw());
            let _ = fd.write_all(buffer);
        });
    }

    fn flush(&self) {
        // nothing
    }
}
