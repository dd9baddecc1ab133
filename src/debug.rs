//! Debug sink (C10): the line-oriented trace every component writes to,
//! independent of the `tracing` subscriber. Mirrors the original's
//! `dprint`/mode selection but as an explicit sink object threaded through
//! components rather than a monkey-patched global function.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Where debug output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    None,
    ScriptDir,
    Cwd,
    Unique,
    Stdout,
}

impl Mode {
    /// `log=0..4` config value, per the external interface table.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Mode::None,
            1 => Mode::ScriptDir,
            2 => Mode::Cwd,
            3 => Mode::Unique,
            _ => Mode::Stdout,
        }
    }
}

enum Destination {
    Discard,
    File(Mutex<File>),
    Stdout(Mutex<()>),
}

/// Process-local sink; file creation happens once, at construction.
pub struct DebugSink {
    destination: Destination,
}

impl DebugSink {
    pub fn new(mode: Mode, pid: u32, port: u16) -> std::io::Result<Self> {
        let destination = match mode {
            Mode::None => Destination::Discard,
            Mode::Stdout => Destination::Stdout(Mutex::new(())),
            Mode::ScriptDir => Destination::File(Mutex::new(open_log(&script_dir_path(pid))?)),
            Mode::Cwd => Destination::File(Mutex::new(open_log(&cwd_path(pid))?)),
            Mode::Unique => Destination::File(Mutex::new(open_log(&unique_path(pid, port))?)),
        };
        Ok(Self { destination })
    }

    /// Writes one trace line. Thread-safety is the sink's own lock, never
    /// the caller's responsibility. Also emits a `tracing::trace!` record
    /// so a `RUST_LOG=trace` capture sees the same line.
    pub fn write(&self, line: &str) {
        tracing::trace!(target: "px::debug", "{line}");
        match &self.destination {
            Destination::Discard => {}
            Destination::Stdout(lock) => {
                let _guard = lock.lock().expect("debug sink mutex poisoned");
                println!("{line}");
            }
            Destination::File(file) => {
                let mut file = file.lock().expect("debug sink mutex poisoned");
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn script_dir_path(pid: u32) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!("debug-{pid}.log"))
}

fn cwd_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("debug-{pid}.log"))
}

fn unique_path(pid: u32, port: u16) -> PathBuf {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    PathBuf::from(format!("debug-{pid}-{port}-{ts}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_level_maps_all_five_levels() {
        assert_eq!(Mode::from_level(0), Mode::None);
        assert_eq!(Mode::from_level(1), Mode::ScriptDir);
        assert_eq!(Mode::from_level(2), Mode::Cwd);
        assert_eq!(Mode::from_level(3), Mode::Unique);
        assert_eq!(Mode::from_level(4), Mode::Stdout);
        assert_eq!(Mode::from_level(99), Mode::Stdout);
    }

    #[test]
    fn none_mode_never_touches_disk() {
        let sink = DebugSink::new(Mode::None, 1, 3128).unwrap();
        sink.write("should be discarded");
    }

    #[test]
    fn cwd_mode_writes_a_line() {
        let dir = std::env::temp_dir().join(format!("px-debug-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(&dir).unwrap();

        let sink = DebugSink::new(Mode::Cwd, 42, 3128).unwrap();
        sink.write("hello from test");

        let contents = std::fs::read_to_string(cwd_path(42)).unwrap();
        assert!(contents.contains("hello from test"));

        std::env::set_current_dir(prev).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
