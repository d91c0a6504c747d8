//! Timestamped line logger (component H).
//!
//! Installed once, at Manager init, as the backing `log::Log`
//! implementation so every other module can just use the ordinary
//! `log::info!`/`warn!`/`error!`/`debug!` macros (§4.H, §10). Writes are
//! unbuffered and logger failures never propagate: the worst case is a
//! missed line, never a crashed reactor.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{LevelFilter, Log, Metadata, Record};

const TIMESTAMP_WIDTH: usize = 19; // "YYYY-MM-DD HH:MM:SS"
const LOG_FILE_MODE: u32 = 0o666;
const LOG_DIR_MODE: u32 = 0o777;

enum Sink {
    File(File),
    Stdout,
}

impl Sink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Sink::File(f) => {
                f.write_all(line.as_bytes())?;
                f.flush()
            }
            Sink::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(line.as_bytes())?;
                out.flush()
            }
        }
    }
}

struct Logger {
    sink: Mutex<Sink>,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{}: {}\n", timestamp(), record.args());
        if let Ok(mut sink) = self.sink.lock() {
            // A write failure here would itself need logging, which is
            // exactly what just failed; drop it on the floor.
            let _ = sink.write_line(&line);
        }
    }

    fn flush(&self) {}
}

fn timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => match DateTime::from_timestamp(dur.as_secs() as i64, 0) {
            Some(dt) => dt
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            None => format!("{:<TIMESTAMP_WIDTH$}", "UNKNOWN TIME"),
        },
        Err(_) => format!("{:<TIMESTAMP_WIDTH$}", "UNKNOWN TIME"),
    }
}

/// Install the Manager's logger as the `log` facade's global backend.
///
/// `log_path` is either `"-"` for standard output, or a file path: its
/// parent directory is created (mode 0777), any existing file at that
/// path is rotated to `<path>.last`, and the fresh file is created mode
/// 0666 (§3, §4.I step 3).
pub fn init(log_path: &str, level: LevelFilter) -> Result<()> {
    let sink = if log_path == "-" {
        Sink::Stdout
    } else {
        Sink::File(open_rotated(Path::new(log_path))?)
    };

    log::set_boxed_logger(Box::new(Logger {
        sink: Mutex::new(sink),
    }))
    .context("installing Manager logger")?;
    log::set_max_level(level);
    Ok(())
}

fn open_rotated(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
        fs::set_permissions(parent, fs::Permissions::from_mode(LOG_DIR_MODE))
            .with_context(|| format!("chmod {} 0777", parent.display()))?;
    }

    if path.exists() {
        let mut backup = path.as_os_str().to_os_string();
        backup.push(".last");
        let backup = Path::new(&backup);
        fs::rename(path, backup)
            .with_context(|| format!("rotating {} to {}", path.display(), backup.display()))?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("creating log file {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(LOG_FILE_MODE))
        .with_context(|| format!("chmod {} 0666", path.display()))?;
    Ok(file)
}
