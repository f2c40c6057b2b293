//! Durable wet/dry point store backed by a dotenv-style `KEY=value` file.
//!
//! The file may be edited by hand or by other tooling while the monitor is
//! running. Values are kept as strings; parsing happens when a plant applies
//! them.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::error::{MonitorError, Result};

/// Full contents of the store at one point in time.
pub type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Point {
    Wet,
    Dry,
}

impl Point {
    pub const ALL: [Point; 2] = [Point::Wet, Point::Dry];
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Wet => write!(f, "WET"),
            Point::Dry => write!(f, "DRY"),
        }
    }
}

/// Store key for a plant's calibration point, e.g. `MONSTERA_WET_POINT`.
pub fn threshold_key(plant_name: &str, point: Point) -> String {
    format!("{}_{point}_POINT", plant_name.to_uppercase())
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Split a `KEY=value` line. Blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, parse_value(value.trim())))
}

/// A quoted value runs to its closing quote. An unquoted value ends at an
/// inline ` #` comment.
fn parse_value(value: &str) -> &str {
    for q in ['\'', '"'] {
        if let Some(rest) = value.strip_prefix(q) {
            if let Some(end) = rest.find(q) {
                return &rest[..end];
            }
        }
    }
    let comment = value
        .char_indices()
        .find(|&(i, c)| c == '#' && value[..i].ends_with(char::is_whitespace))
        .map_or(value.len(), |(i, _)| i);
    value[..comment].trim_end()
}

/// Render `value` so that `parse_value` reads it back unchanged.
fn encode_value(value: &str) -> std::result::Result<String, &'static str> {
    if value.chars().any(char::is_control) {
        return Err("value contains control characters");
    }
    let needs_quotes = value != value.trim()
        || value.starts_with(['\'', '"'])
        || value.contains('#');
    if !needs_quotes {
        return Ok(value.to_string());
    }
    ['\'', '"']
        .into_iter()
        .find(|&q| !value.contains(q))
        .map(|q| format!("{q}{value}{q}"))
        .ok_or("value contains both quote characters")
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('#')
        && !key.contains('=')
        && !key.chars().any(|c| c.is_whitespace() || c.is_control())
}

pub(crate) fn parse(contents: &str) -> Snapshot {
    contents
        .lines()
        .filter_map(parse_line)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Rewrite `contents` with `key` set to `value`, keeping every other line.
fn upsert(contents: &str, key: &str, value: &str) -> String {
    let mut out = String::with_capacity(contents.len() + key.len() + value.len() + 2);
    let mut replaced = false;

    for line in contents.lines() {
        match parse_line(line) {
            Some((k, _)) if k == key => {
                if !replaced {
                    out.push_str(&format!("{key}={value}\n"));
                    replaced = true;
                }
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    if !replaced {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct ThresholdStore {
    path: PathBuf,
    /// Values as of the last `reload`.
    cache: RwLock<Snapshot>,
    /// Serialises read-modify-write cycles in `set`.
    write_lock: Mutex<()>,
}

impl ThresholdStore {
    /// Open the store. Nothing is read until `reload` or `get_all`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(Snapshot::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unreadable(&self, source: io::Error) -> MonitorError {
        MonitorError::ConfigUnreadable {
            path: self.path.clone(),
            source,
        }
    }

    fn read_contents(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(s),
            // Not created yet: nothing has been persisted.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(self.unreadable(e)),
        }
    }

    /// Fresh snapshot of the durable file.
    pub fn get_all(&self) -> Result<Snapshot> {
        Ok(parse(&self.read_contents()?))
    }

    /// Persist a single key. The file is replaced via rename so concurrent
    /// readers see either the old or the new contents. Values that could not
    /// be read back as exactly one line for `key` are rejected.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let invalid = |reason: &str| MonitorError::InvalidThreshold {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if !valid_key(key) {
            return Err(invalid("invalid key"));
        }
        let encoded = encode_value(value).map_err(invalid)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let contents = upsert(&self.read_contents()?, key, &encoded);
        let tmp = self.path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(contents.as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| self.unreadable(e))?;

        debug!(%key, %value, path = %self.path.display(), "threshold persisted");
        Ok(())
    }

    /// Re-read the durable file into the in-process cache.
    pub fn reload(&self) -> Result<()> {
        let snapshot = self.get_all()?;
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }

    /// Cached value for `key` as of the last `reload`.
    pub fn cached(&self, key: &str) -> Option<String> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
