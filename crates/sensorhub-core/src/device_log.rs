//! Rotating per-device sample log.
//!
//! Grounded in `original_source/src/log.h`'s `init_device_log`: one
//! append-only file per device, rotated once it passes a size limit, with a
//! bounded number of numbered backups.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};

fn wrap(e: std::io::Error) -> Error {
    Error::DeviceLog(e.to_string())
}

/// Appends `{unix_time_s:.15f},{quantity_name},{value}\n` lines to
/// `{dir}/{device_id}.log`, rotating to `.1`, `.2`, ... once the current
/// file exceeds `max_size` bytes, keeping at most `max_files` backups.
pub struct DeviceLog {
    path: PathBuf,
    max_size: u64,
    max_files: u32,
    file: File,
    size: u64,
}

impl DeviceLog {
    pub fn open(dir: &Path, device_id: &str, max_size: u64, max_files: u32) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(wrap)?;
        let path = dir.join(format!("{device_id}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path).map_err(wrap)?;
        let size = file.metadata().map_err(wrap)?.len();
        Ok(DeviceLog { path, max_size: max_size.max(1), max_files, file, size })
    }

    /// Write one line, rotating first if it would push the file over
    /// `max_size`.
    pub fn write_line(&mut self, line: &str) {
        if self.size + line.len() as u64 > self.max_size {
            if let Err(e) = self.rotate() {
                warn!("failed to rotate device log {}: {e}", self.path.display());
            }
        }
        if let Err(e) = self.file.write_all(line.as_bytes()) {
            warn!("failed to write device log {}: {e}", self.path.display());
            return;
        }
        self.size += line.len() as u64;
    }

    fn rotate(&mut self) -> Result<()> {
        if self.max_files > 0 {
            let oldest = self.backup_path(self.max_files);
            if oldest.exists() {
                std::fs::remove_file(&oldest).map_err(wrap)?;
            }
            for n in (1..self.max_files).rev() {
                let from = self.backup_path(n);
                if from.exists() {
                    std::fs::rename(&from, self.backup_path(n + 1)).map_err(wrap)?;
                }
            }
            std::fs::rename(&self.path, self.backup_path(1)).map_err(wrap)?;
        } else {
            std::fs::remove_file(&self.path).map_err(wrap)?;
        }
        self.file = OpenOptions::new().create(true).append(true).open(&self.path).map_err(wrap)?;
        self.size = 0;
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        self.path.with_extension(format!("log.{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: u32) -> String {
        format!("{n}.000000000000000,ut,{n}\n")
    }

    #[test]
    fn writes_append_to_the_device_named_file() {
        let dir = std::env::temp_dir().join(format!("device_log_test_{}", std::process::id()));
        let mut log = DeviceLog::open(&dir, "xsens0", 1024, 2).unwrap();
        log.write_line(&line(1));
        log.write_line(&line(2));
        let contents = std::fs::read_to_string(dir.join("xsens0.log")).unwrap();
        assert_eq!(contents, format!("{}{}", line(1), line(2)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rotates_once_the_size_limit_is_crossed_and_keeps_only_max_files_backups() {
        let dir = std::env::temp_dir().join(format!("device_log_rotate_test_{}", std::process::id()));
        let line_len = line(1).len() as u64;
        let mut log = DeviceLog::open(&dir, "xsens0", line_len, 2).unwrap();
        for n in 1..=4 {
            log.write_line(&line(n));
        }
        assert!(!dir.join("xsens0.log.3").exists());
        assert!(dir.join("xsens0.log.2").exists());
        assert!(dir.join("xsens0.log.1").exists());
        assert_eq!(std::fs::read_to_string(dir.join("xsens0.log")).unwrap(), line(4));
        assert_eq!(std::fs::read_to_string(dir.join("xsens0.log.1")).unwrap(), line(3));
        std::fs::remove_dir_all(&dir).ok();
    }
}
