//! Content-hash keys for the two binary-cache resource kinds.
//!
//! Nix binary caches address metadata (`<hash>.narinfo`) by a 32-character
//! store-path hash and archives (`nar/<hash>.nar[.ext]`) by a 52-character
//! file hash followed by the `.nar` suffix and optional compression
//! extensions.  Both alphabets are lowercase ASCII alphanumerics.

use std::fmt;

use prometheus_client::encoding::EncodeLabelValue;

/// Length of a narinfo (store path) hash.
pub const NARINFO_HASH_LEN: usize = 32;

/// Length of a NAR file hash, excluding the `.nar` suffix.
pub const NAR_HASH_LEN: usize = 52;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Which of the two resource kinds a key refers to.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Category {
    /// Small metadata document describing a store path.
    Narinfo,
    /// Binary archive payload.
    Nar,
}

impl Category {
    /// Subdirectory of the state root holding entries of this category.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Narinfo => "narinfo",
            Self::Nar => "nar",
        }
    }

    /// `Content-Type` used when serving a cached entry.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Narinfo => "text/x-nix-narinfo",
            Self::Nar => "application/x-nix-nar",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// A validated cache key.
///
/// For [`Category::Nar`] the key carries the full file name
/// (`<hash>.nar.xz`), because the compression suffix is part of the
/// upstream address and of the on-disk name.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ContentHash {
    category: Category,
    value: String,
}

impl ContentHash {
    /// Parse the file segment of a `/<hash>.narinfo` request.
    ///
    /// Accepts exactly `<32 x [a-z0-9]>.narinfo`.
    pub fn parse_narinfo(file: &str) -> Option<Self> {
        let hash = file.strip_suffix(".narinfo")?;
        if hash.len() != NARINFO_HASH_LEN || !is_hash_alphabet(hash) {
            return None;
        }
        Some(Self {
            category: Category::Narinfo,
            value: hash.to_owned(),
        })
    }

    /// Parse the file segment of a `/nar/<file>` request.
    ///
    /// Accepts `<52 x [a-z0-9]>.nar` followed by zero or more
    /// `.<[a-z0-9]+>` extensions, e.g. `.nar.xz` or `.nar.zst`.
    pub fn parse_nar(file: &str) -> Option<Self> {
        if file.len() < NAR_HASH_LEN || !file.is_char_boundary(NAR_HASH_LEN) {
            return None;
        }
        let (hash, suffix) = file.split_at(NAR_HASH_LEN);
        if !is_hash_alphabet(hash) {
            return None;
        }

        let mut exts = suffix.strip_prefix('.')?.split('.');
        if exts.next() != Some("nar") {
            return None;
        }
        if !exts.all(|ext| !ext.is_empty() && is_hash_alphabet(ext)) {
            return None;
        }

        Some(Self {
            category: Category::Nar,
            value: file.to_owned(),
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// File name of the store entry for this key.
    pub fn file_name(&self) -> String {
        match self.category {
            Category::Narinfo => format!("{}.narinfo", self.value),
            Category::Nar => self.value.clone(),
        }
    }

    /// Path of this resource relative to an upstream base URL.
    pub fn upstream_path(&self) -> String {
        match self.category {
            Category::Narinfo => format!("{}.narinfo", self.value),
            Category::Nar => format!("nar/{}", self.value),
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

fn is_hash_alphabet(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
