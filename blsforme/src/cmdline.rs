// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Assembles the final kernel command line from vendor and admin
//! `cmdline.d` snippet directories plus an optional admin global override,
//! honouring `/dev/null`-symlink masking and a final whole-word removal pass.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use fs_err as fs;

use crate::file_utils::join_cmdline_lines;

/// One fragment contributed to the final cmdline, kept for diagnostics
#[derive(Debug, Clone)]
pub struct Fragment {
    pub source: PathBuf,
    pub text: String,
}

/// Assembles a full kernel cmdline from layered snippet directories
#[derive(Debug, Default)]
pub struct Assembler {
    vendor_dir: Option<PathBuf>,
    admin_dir: Option<PathBuf>,
    admin_global: Option<PathBuf>,
    removal_dir: Option<PathBuf>,
    remove: Vec<String>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `usr/share/kernel/cmdline.d`, lowest priority
    pub fn with_vendor_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.vendor_dir = Some(dir.into());
        self
    }

    /// `etc/kernel/cmdline.d`, masks same-basename vendor snippets
    pub fn with_admin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.admin_dir = Some(dir.into());
        self
    }

    /// `etc/kernel/cmdline`, appended after all `cmdline.d` snippets
    pub fn with_admin_global(mut self, file: impl Into<PathBuf>) -> Self {
        self.admin_global = Some(file.into());
        self
    }

    /// `etc/kernel/cmdline-removal.d`, `*.conf` files whose whitespace
    /// separated tokens are stripped from the assembled line
    pub fn with_removal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.removal_dir = Some(dir.into());
        self
    }

    /// Tokens to strip from the assembled line, matched as whole words
    pub fn remove(mut self, tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.remove = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Vendor `cmdline.d` fragments, in basename order, skipping any
    /// basename masked by a `/dev/null` symlink of the same name in the
    /// admin `cmdline.d` directory.
    fn vendor_fragments(&self) -> Vec<Fragment> {
        let Some(dir) = self.vendor_dir.as_ref() else {
            return vec![];
        };

        let masked: BTreeMap<String, ()> = self
            .admin_dir
            .as_ref()
            .map(|dir| {
                list_snippets(dir)
                    .into_iter()
                    .filter(|(_, path)| is_masked(path))
                    .map(|(name, _)| (name, ()))
                    .collect()
            })
            .unwrap_or_default();

        list_snippets(dir)
            .into_iter()
            .filter(|(name, _)| !masked.contains_key(name))
            .filter_map(|(_, path)| snippet_fragment(&path))
            .collect()
    }

    /// Admin `cmdline.d` fragments, in basename order, skipping any that
    /// are themselves `/dev/null` disable sentinels.
    fn admin_fragments(&self) -> Vec<Fragment> {
        let Some(dir) = self.admin_dir.as_ref() else {
            return vec![];
        };
        list_snippets(dir)
            .into_iter()
            .filter(|(_, path)| !is_masked(path))
            .filter_map(|(_, path)| snippet_fragment(&path))
            .collect()
    }

    /// Programmatically supplied removal tokens plus every whitespace
    /// separated token parsed out of `etc/kernel/cmdline-removal.d/*.conf`
    fn removal_tokens(&self) -> Vec<String> {
        let mut tokens = self.remove.clone();
        if let Some(dir) = self.removal_dir.as_ref() {
            for (_, path) in list_snippets(dir) {
                if let Ok(text) = fs::read_to_string(&path) {
                    tokens.extend(join_cmdline_lines(&text).split_whitespace().map(str::to_string));
                }
            }
        }
        tokens
    }

    /// Produce the final, de-duplicated, mask- and removal-resolved cmdline.
    ///
    /// Ordering: vendor `cmdline.d`, then the admin global override, then
    /// admin `cmdline.d`.
    pub fn assemble(&self) -> String {
        let mut parts: Vec<String> = self.vendor_fragments().into_iter().map(|f| f.text).collect();

        if let Some(global) = self.admin_global.as_ref() {
            if let Ok(text) = fs::read_to_string(global) {
                let joined = join_cmdline_lines(&text);
                if !joined.is_empty() {
                    parts.push(joined);
                }
            }
        }

        parts.extend(self.admin_fragments().into_iter().map(|f| f.text));

        let joined = parts.join(" ");
        let removal = self.removal_tokens();
        if removal.is_empty() {
            return normalise(&joined);
        }

        normalise(
            &joined
                .split_whitespace()
                .filter(|tok| !removal.iter().any(|r| token_matches(tok, r)))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

/// Whole-word match, honouring `key=value` tokens when the removal spec has no `=`
fn token_matches(token: &str, removal: &str) -> bool {
    if removal.contains('=') {
        token == removal
    } else {
        token == removal || token.split_once('=').map(|(key, _)| key) == Some(removal)
    }
}

fn normalise(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_masked(path: &Path) -> bool {
    fs::read_link(path)
        .map(|target| target.to_string_lossy().contains("/dev/null"))
        .unwrap_or(false)
}

fn snippet_fragment(path: &Path) -> Option<Fragment> {
    let text = fs::read_to_string(path).ok()?;
    let joined = join_cmdline_lines(&text);
    if joined.is_empty() {
        return None;
    }
    Some(Fragment {
        source: path.to_path_buf(),
        text: joined,
    })
}

fn list_snippets(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    let mut out = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|ext| ext == "conf").unwrap_or(false))
        .filter_map(|e| Some((e.file_name().to_string_lossy().to_string(), e.path())))
        .collect::<Vec<_>>();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use std::fs as stdfs;

    use super::*;

    #[test]
    fn admin_snippet_masks_vendor_snippet() {
        let root = tempfile::tempdir().unwrap();
        let vendor = root.path().join("vendor");
        let admin = root.path().join("admin");
        stdfs::create_dir_all(&vendor).unwrap();
        stdfs::create_dir_all(&admin).unwrap();

        stdfs::write(vendor.join("00-quiet.conf"), "quiet splash").unwrap();
        std::os::unix::fs::symlink("/dev/null", admin.join("00-quiet.conf")).unwrap();
        stdfs::write(admin.join("10-extra.conf"), "log_buf_len=1M").unwrap();

        let cmdline = Assembler::new()
            .with_vendor_dir(&vendor)
            .with_admin_dir(&admin)
            .assemble();

        assert!(!cmdline.contains("quiet"));
        assert!(cmdline.contains("log_buf_len=1M"));
    }

    #[test]
    fn admin_global_is_ordered_between_vendor_and_admin_dir() {
        let root = tempfile::tempdir().unwrap();
        let vendor = root.path().join("vendor");
        let admin = root.path().join("admin");
        stdfs::create_dir_all(&vendor).unwrap();
        stdfs::create_dir_all(&admin).unwrap();

        stdfs::write(vendor.join("00-vendor.conf"), "vendor_tok").unwrap();
        let global = root.path().join("cmdline");
        stdfs::write(&global, "global_tok").unwrap();
        stdfs::write(admin.join("00-admin.conf"), "admin_tok").unwrap();

        let cmdline = Assembler::new()
            .with_vendor_dir(&vendor)
            .with_admin_global(&global)
            .with_admin_dir(&admin)
            .assemble();

        assert_eq!(cmdline, "vendor_tok global_tok admin_tok");
    }

    #[test]
    fn removal_dir_tokens_are_stripped_whole_word() {
        let root = tempfile::tempdir().unwrap();
        let vendor = root.path().join("vendor");
        let removal = root.path().join("removal");
        stdfs::create_dir_all(&vendor).unwrap();
        stdfs::create_dir_all(&removal).unwrap();

        stdfs::write(vendor.join("00-base.conf"), "quiet splash quietness=1").unwrap();
        stdfs::write(removal.join("00-quiet.conf"), "quiet").unwrap();

        let cmdline = Assembler::new()
            .with_vendor_dir(&vendor)
            .with_removal_dir(&removal)
            .assemble();

        assert_eq!(cmdline, "splash quietness=1");
    }

    #[test]
    fn removal_pass_is_whole_word() {
        let cmdline = Assembler::new().remove(["quiet"]).assemble_from_text("quiet splash quietness=1");
        assert_eq!(cmdline, "splash quietness=1");
    }

    impl Assembler {
        fn assemble_from_text(&self, text: &str) -> String {
            let joined = text
                .split_whitespace()
                .filter(|tok| !self.remove.iter().any(|r| token_matches(tok, r)))
                .collect::<Vec<_>>()
                .join(" ");
            normalise(&joined)
        }
    }
}
