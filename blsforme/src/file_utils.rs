// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Atomic file helpers shared by every bootloader backend

use std::{
    io,
    path::{Path, PathBuf},
};

use fs_err as fs;

/// Case-insensitive path joining, since VFAT ESPs may have been populated by
/// firmware or other OSes using any casing for `EFI`, `Boot`, etc.
pub trait PathExt {
    fn join_insensitive(&self, part: impl AsRef<str>) -> PathBuf;
}

impl PathExt for Path {
    fn join_insensitive(&self, part: impl AsRef<str>) -> PathBuf {
        let part = part.as_ref();
        if let Ok(entries) = std::fs::read_dir(self) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.eq_ignore_ascii_case(part) {
                        return entry.path();
                    }
                }
            }
        }
        self.join(part)
    }
}

/// Content-hash each `(source, destination)` pair and return only those
/// whose destination is missing or whose bytes differ from the source.
pub fn changed_files(pairs: &[(PathBuf, PathBuf)]) -> Vec<(PathBuf, PathBuf)> {
    pairs
        .iter()
        .filter(|(source, dest)| !files_match(source, dest))
        .cloned()
        .collect()
}

fn files_match(source: &Path, dest: &Path) -> bool {
    if !dest.exists() {
        return false;
    }
    match (hash_file(source), hash_file(dest)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let data = fs::read(path)?;
    Ok(blake3::hash(&data))
}

/// Copy `source` onto `dest` using the temp-file-then-rename pattern:
/// write to `<dest>.TmpWrite`, sync, unlink any existing `dest`, sync,
/// rename into place, sync. This is the crash-safe primitive every
/// bootloader backend uses to mutate the ESP.
pub fn copy_atomic_vfat(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<()> {
    let source = source.as_ref();
    let dest = dest.as_ref();

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = PathBuf::from(format!("{}.TmpWrite", dest.display()));
    fs::copy(source, &tmp)?;
    sync_file(&tmp)?;

    if dest.exists() {
        fs::remove_file(dest)?;
        sync_dir(dest)?;
    }

    fs::rename(&tmp, dest)?;
    sync_dir(dest)?;

    Ok(())
}

/// Removes `path` if present, tolerating a missing file
pub fn remove_if_exists(path: impl AsRef<Path>) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes a directory tree if present, tolerating a missing directory
pub fn remove_dir_if_exists(path: impl AsRef<Path>) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn sync_enabled() -> bool {
    std::env::var_os("BLSFORME_DISABLE_SYNC").is_none()
}

fn sync_file(path: &Path) -> io::Result<()> {
    if !sync_enabled() {
        return Ok(());
    }
    if let Ok(f) = std::fs::File::open(path) {
        let _ = f.sync_all();
    }
    nix::unistd::sync();
    Ok(())
}

fn sync_dir(path: &Path) -> io::Result<()> {
    if !sync_enabled() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if let Ok(f) = std::fs::File::open(parent) {
            let _ = f.sync_all();
        }
    }
    nix::unistd::sync();
    Ok(())
}

/// Parse one cmdline snippet file: strip each line, drop blanks and
/// `#`-comments, join the remainder with single spaces.
pub fn cmdline_snippet(path: impl AsRef<Path>) -> Result<String, crate::Error> {
    let text = fs::read_to_string(path.as_ref()).map_err(|source| crate::Error::Io { source })?;
    Ok(join_cmdline_lines(&text))
}

/// Shared line-join rule used by both per-kernel cmdline snippets and the
/// global cmdline.d assembler.
pub fn join_cmdline_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn join_cmdline_lines_skips_blanks_and_comments() {
        let text = "  \n# comment\nquiet splash\n  loglevel=3  \n";
        assert_eq!(join_cmdline_lines(text), "quiet splash loglevel=3");
    }

    #[test]
    fn copy_atomic_vfat_writes_identical_bytes() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let dest = dir.path().join("dest.bin");
        std::fs::write(&source, b"hello world").unwrap();

        copy_atomic_vfat(&source, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!dest.with_extension("TmpWrite").exists());
    }

    #[test]
    fn changed_files_skips_identical_content() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.bin");
        let dest = dir.path().join("b.bin");
        std::fs::write(&source, b"same").unwrap();
        std::fs::write(&dest, b"same").unwrap();

        assert!(changed_files(&[(source.clone(), dest.clone())]).is_empty());

        let mut f = std::fs::File::create(&dest).unwrap();
        f.write_all(b"different").unwrap();
        assert_eq!(changed_files(&[(source, dest)]).len(), 1);
    }
}
