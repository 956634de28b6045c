//! Low-level sysfs/configfs attribute access
//!
//! Kernel attributes want a single atomic write() with the complete value;
//! partial writes or a second write() may leave the attribute half-set or
//! return EINVAL. All writers here build the full buffer (with trailing
//! newline) before touching the file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Write a string value to a kernel attribute.
pub fn write_attr(path: &Path, value: &str) -> Result<()> {
    debug!("WRITE {} '{}'", path.display(), value);

    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: open for writing failed: {}", path.display(), e),
        ))
    })?;

    let mut buf = value.as_bytes().to_vec();
    if !value.ends_with('\n') {
        buf.push(b'\n');
    }

    file.write_all(&buf).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: write failed: {}", path.display(), e),
        ))
    })?;

    file.flush()?;
    Ok(())
}

/// Read a kernel attribute, trimmed of surrounding whitespace.
pub fn read_attr(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: read failed: {}", path.display(), e),
        ))
    })?;
    let value = text.trim().to_string();
    debug!("READ {} '{}'", path.display(), value);
    Ok(value)
}

/// Create a function registration directory. An already existing directory
/// counts as success.
pub fn ensure_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if path.is_dir() {
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "{}: exists but is not a directory",
                    path.display()
                )))
            }
        }
        Err(e) => Err(Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: mkdir failed: {}", path.display(), e),
        ))),
    }
}

/// Replace `dest` with a symlink to `src`. An existing symlink is replaced;
/// any other file type at `dest` is a configuration error.
pub fn replace_symlink(src: &Path, dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(dest)?;
        }
        Ok(_) => {
            return Err(Error::Config(format!(
                "{}: exists but is not a symlink",
                dest.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    std::os::unix::fs::symlink(src, dest).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!(
                "{}: symlink to {} failed: {}",
                dest.display(),
                src.display(),
                e
            ),
        ))
    })
}

/// Remove a symlink. Anything other than a symlink at `path` is a
/// configuration error.
pub fn remove_symlink(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.file_type().is_symlink() {
        return Err(Error::Config(format!(
            "{}: is not a symlink",
            path.display()
        )));
    }
    fs::remove_file(path)?;
    Ok(())
}

/// Normalize a hex device id to the `0xnnnn` form the kernel expects.
///
/// Configuration files carry values like `0A02` or `0x0A02`; values that do
/// not parse as hex pass through unchanged.
pub fn normalize_hex_id(id: &str) -> String {
    let trimmed = id.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return id.to_string();
    }

    match u32::from_str_radix(digits, 16) {
        Ok(num) => format!("0x{:04x}", num),
        Err(_) => id.to_string(),
    }
}
