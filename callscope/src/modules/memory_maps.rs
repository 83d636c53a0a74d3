//! Memory mapping utilities for our own address space
//!
//! Parses `/proc/self/maps` into [`MapEntry`] records. The patcher uses it to
//! find the protection of the pages it is about to rewrite; module discovery
//! uses it to find where each executable image is loaded.

use anyhow::{Context, Result};
use std::fs;

/// Address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub range: MemoryRange,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// File offset of `range.start`
    pub offset: u64,
    /// Backing file, if the mapping has one
    pub path: Option<String>,
}

impl MapEntry {
    /// `PROT_*` flags matching the permission string
    #[must_use]
    pub fn protection(&self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.readable {
            prot |= libc::PROT_READ;
        }
        if self.writable {
            prot |= libc::PROT_WRITE;
        }
        if self.executable {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Parse the contents of a maps file, skipping malformed lines
#[must_use]
pub fn parse_maps(text: &str) -> Vec<MapEntry> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MapEntry> {
    // "start-end perms offset dev inode pathname"
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?.as_bytes();
    let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.collect::<Vec<_>>().join(" ");

    if perms.len() < 3 {
        return None;
    }
    Some(MapEntry {
        range: MemoryRange {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
        },
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        executable: perms[2] == b'x',
        offset,
        path: (!path.is_empty()).then_some(path),
    })
}

/// Read and parse `/proc/self/maps`
///
/// # Errors
/// Returns an error if the maps file cannot be read
pub fn read_self_maps() -> Result<Vec<MapEntry>> {
    let maps = fs::read_to_string("/proc/self/maps").context("Failed to read /proc/self/maps")?;
    Ok(parse_maps(&maps))
}

/// Mappings overlapping `range`, in address order
///
/// # Errors
/// Returns an error if the maps file cannot be read
pub fn mappings_overlapping(range: MemoryRange) -> Result<Vec<MapEntry>> {
    Ok(read_self_maps()?.into_iter().filter(|e| e.range.overlaps(&range)).collect())
}
