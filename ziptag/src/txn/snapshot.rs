// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Snapshot files and the MANIFEST
//!
//! A snapshot is an atomic image of committed state at one revision:
//! `current_rev`, `next_tref`, all live tags, all live links. It is written
//! to a temp file and renamed into place, so a partially-written snapshot is
//! never observed. The plain-text MANIFEST records the latest snapshot rev
//! and the WAL head segment recovery should scan from.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::store::{Generation, Tag, TagRef};

use super::wal::WalError;

const SNAPSHOT_MAGIC: u32 = 0x5A54_534E;
const SNAPSHOT_VERSION: u16 = 1;

/// Parsed MANIFEST contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub snapshot_rev: Option<u64>,
    pub wal_head: u64,
}

pub fn snapshot_path(dir: &Path, rev: u64) -> PathBuf {
    dir.join(format!("snapshot-{:012}.bin", rev))
}

fn io_err(path: &Path, source: std::io::Error) -> WalError {
    WalError::Io {
        path: Some(path.to_path_buf()),
        source,
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn corrupt(&self, reason: &str) -> WalError {
        WalError::Corrupt {
            offset: self.pos as u64,
            reason: reason.to_string(),
        }
    }

    fn u16(&mut self) -> Result<u16, WalError> {
        if self.pos + 2 > self.bytes.len() {
            return Err(self.corrupt("truncated u16"));
        }
        let v = u16::from_le_bytes(self.bytes[self.pos..self.pos + 2].try_into().expect("len"));
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, WalError> {
        if self.pos + 4 > self.bytes.len() {
            return Err(self.corrupt("truncated u32"));
        }
        let v = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().expect("len"));
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, WalError> {
        if self.pos + 8 > self.bytes.len() {
            return Err(self.corrupt("truncated u64"));
        }
        let v = u64::from_le_bytes(self.bytes[self.pos..self.pos + 8].try_into().expect("len"));
        self.pos += 8;
        Ok(v)
    }

    fn str(&mut self) -> Result<String, WalError> {
        let len = self.u32()? as usize;
        if self.pos + len > self.bytes.len() {
            return Err(self.corrupt("truncated string"));
        }
        let s = std::str::from_utf8(&self.bytes[self.pos..self.pos + len])
            .map_err(|_| self.corrupt("invalid utf-8"))?
            .to_string();
        self.pos += len;
        Ok(s)
    }
}

/// Write a snapshot of `gen` at its own revision. Returns the final path.
pub fn write_snapshot(dir: &Path, gen: &Generation) -> Result<PathBuf, WalError> {
    let mut body = Vec::with_capacity(4096);
    body.extend_from_slice(&gen.rev.to_le_bytes());
    body.extend_from_slice(&gen.next_tref.to_le_bytes());

    let tags: Vec<&Tag> = gen.live_tags_at(gen.rev).collect();
    body.extend_from_slice(&(tags.len() as u64).to_le_bytes());
    for tag in tags {
        body.extend_from_slice(&tag.tref.raw().to_le_bytes());
        body.extend_from_slice(&tag.create_rev.to_le_bytes());
        put_str(&mut body, &tag.ttype);
        put_str(&mut body, &tag.val);
    }

    let links = gen.live_links_at(gen.rev);
    body.extend_from_slice(&(links.len() as u64).to_le_bytes());
    for (a, b, ver) in &links {
        body.extend_from_slice(&a.raw().to_le_bytes());
        body.extend_from_slice(&b.raw().to_le_bytes());
        body.extend_from_slice(&ver.create_rev.to_le_bytes());
    }

    let path = snapshot_path(dir, gen.rev);
    let tmp = path.with_extension("bin.tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(&SNAPSHOT_MAGIC.to_le_bytes())
            .map_err(|e| io_err(&tmp, e))?;
        file.write_all(&SNAPSHOT_VERSION.to_le_bytes())
            .map_err(|e| io_err(&tmp, e))?;
        file.write_all(&crc32c::crc32c(&body).to_le_bytes())
            .map_err(|e| io_err(&tmp, e))?;
        file.write_all(&body).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    info!(
        "snapshot written at rev {} ({} bytes)",
        gen.rev,
        body.len() + 10
    );
    Ok(path)
}

/// Load a snapshot file back into a generation.
pub fn load_snapshot(path: &Path) -> Result<Generation, WalError> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| io_err(path, e))?;

    let mut cur = Cursor {
        bytes: &bytes,
        pos: 0,
    };
    let magic = cur.u32()?;
    if magic != SNAPSHOT_MAGIC {
        return Err(cur.corrupt("bad snapshot magic"));
    }
    let version = cur.u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(cur.corrupt("unsupported snapshot version"));
    }
    let expected_crc = cur.u32()?;
    let body_start = cur.pos;
    if crc32c::crc32c(&bytes[body_start..]) != expected_crc {
        return Err(WalError::Corrupt {
            offset: 0,
            reason: "snapshot crc mismatch".into(),
        });
    }

    let rev = cur.u64()?;
    let next_tref = cur.u64()?;
    let tag_count = cur.u64()? as usize;
    let mut tags = Vec::with_capacity(tag_count);
    for _ in 0..tag_count {
        let tref = TagRef::new(cur.u64()?);
        let create_rev = cur.u64()?;
        let ttype = cur.str()?;
        let val = cur.str()?;
        tags.push(Tag::new(tref, ttype, val, create_rev));
    }
    let link_count = cur.u64()? as usize;
    let mut links = Vec::with_capacity(link_count);
    for _ in 0..link_count {
        let a = TagRef::new(cur.u64()?);
        let b = TagRef::new(cur.u64()?);
        let create_rev = cur.u64()?;
        links.push((a, b, create_rev));
    }
    debug!(
        "snapshot loaded: rev {}, {} tags, {} links",
        rev, tag_count, link_count
    );
    Ok(Generation::from_parts(rev, next_tref, tags, links))
}

/// Find the newest snapshot file in `dir`.
pub fn latest_snapshot(dir: &Path) -> Result<Option<(u64, PathBuf)>, WalError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(dir, e)),
    };
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(rev) = name
                .strip_prefix("snapshot-")
                .and_then(|s| s.strip_suffix(".bin"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                if best.as_ref().map(|(r, _)| rev > *r).unwrap_or(true) {
                    best = Some((rev, entry.path()));
                }
            }
        }
    }
    Ok(best)
}

/// Remove snapshot files older than `keep_rev`.
pub fn remove_snapshots_before(dir: &Path, keep_rev: u64) -> Result<(), WalError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(rev) = name
                .strip_prefix("snapshot-")
                .and_then(|s| s.strip_suffix(".bin"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                if rev < keep_rev {
                    let path = entry.path();
                    std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                    debug!("removed stale snapshot {}", path.display());
                }
            }
        }
    }
    Ok(())
}

/// Read the MANIFEST, if present.
pub fn read_manifest(dir: &Path) -> Result<Option<Manifest>, WalError> {
    let path = dir.join("MANIFEST");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(&path, e)),
    };
    let mut manifest = Manifest::default();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("snapshot"), Some(rev)) => {
                manifest.snapshot_rev = rev.parse().ok();
            }
            (Some("wal-head"), Some(seq)) => {
                manifest.wal_head = seq.parse().unwrap_or(0);
            }
            _ => {}
        }
    }
    Ok(Some(manifest))
}

/// Atomically rewrite the MANIFEST.
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), WalError> {
    let path = dir.join("MANIFEST");
    let tmp = dir.join("MANIFEST.tmp");
    let mut text = String::new();
    if let Some(rev) = manifest.snapshot_rev {
        text.push_str(&format!("snapshot {}\n", rev));
    }
    text.push_str(&format!("wal-head {}\n", manifest.wal_head));
    {
        let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(text.as_bytes()).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ResolvedDelta, TagStore};

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TagStore::new();
        store.install_delta(
            &ResolvedDelta {
                new_tags: vec![
                    ("person".into(), "ada".into(), TagRef::new(1)),
                    ("language".into(), "python".into(), TagRef::new(2)),
                ],
                added_links: vec![(TagRef::new(1), TagRef::new(2))],
                next_tref: 3,
                ..Default::default()
            },
            1,
        );
        let gen = store.generation();
        let path = write_snapshot(dir.path(), &gen).unwrap();
        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded.rev, 1);
        assert_eq!(loaded.next_tref, 3);
        assert_eq!(
            loaded.lookup_identity("person", "ada", 1),
            Some(TagRef::new(1))
        );
        assert!(loaded.live_link(TagRef::new(1), TagRef::new(2), 1));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_manifest(dir.path()).unwrap(), None);
        let manifest = Manifest {
            snapshot_rev: Some(12),
            wal_head: 4,
        };
        write_manifest(dir.path(), &manifest).unwrap();
        assert_eq!(read_manifest(dir.path()).unwrap(), Some(manifest));
    }

    #[test]
    fn test_latest_snapshot_prefers_highest_rev() {
        let dir = tempfile::tempdir().unwrap();
        let store = TagStore::new();
        store.install_delta(
            &ResolvedDelta {
                new_tags: vec![("x".into(), "1".into(), TagRef::new(1))],
                next_tref: 2,
                ..Default::default()
            },
            1,
        );
        write_snapshot(dir.path(), &store.generation()).unwrap();
        store.install_delta(
            &ResolvedDelta {
                new_tags: vec![("x".into(), "2".into(), TagRef::new(2))],
                next_tref: 3,
                ..Default::default()
            },
            2,
        );
        write_snapshot(dir.path(), &store.generation()).unwrap();
        let (rev, _) = latest_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(rev, 2);
    }
}
