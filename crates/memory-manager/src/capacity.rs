// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Memory-space capacity limits and parsing.
//!
//! A [`Capacity`] caps how many bytes a memory resource may hand out at
//! once. It is how an accelerator's finite memory is modelled, and it
//! lets tests provoke allocation failures deterministically.

use crate::MemoryError;
use std::fmt;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Suffixes accepted by [`Capacity::parse`], longest first.
const SUFFIXES: &[(&str, usize)] = &[
    ("GB", GB),
    ("G", GB),
    ("MB", MB),
    ("M", MB),
    ("KB", KB),
    ("K", KB),
    ("B", 1),
];

/// An upper bound on the bytes a memory resource may have live.
///
/// # Parsing
/// `"512M"`, `"512MB"`, `"1G"`, `"2048K"`, a plain byte count such as
/// `"1048576"`, or `"unlimited"`. Case-insensitive.
///
/// # Examples
/// ```
/// use memory_manager::Capacity;
///
/// let c = Capacity::parse("64M").unwrap();
/// assert_eq!(c.bytes(), Some(64 * 1024 * 1024));
/// assert!(Capacity::parse("unlimited").unwrap().is_unlimited());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capacity {
    /// `None` means no limit.
    bytes: Option<usize>,
}

impl Capacity {
    /// No limit beyond what the process allocator can provide.
    pub fn unlimited() -> Self {
        Self { bytes: None }
    }

    pub fn from_bytes(bytes: usize) -> Self {
        Self { bytes: Some(bytes) }
    }

    /// `mb` mebibytes, saturating at `usize::MAX` bytes.
    pub fn from_mb(mb: usize) -> Self {
        Self::from_bytes(mb.saturating_mul(MB))
    }

    /// `gb` gibibytes, saturating at `usize::MAX` bytes.
    pub fn from_gb(gb: usize) -> Self {
        Self::from_bytes(gb.saturating_mul(GB))
    }

    /// The limit in bytes, or `None` when unlimited.
    pub fn bytes(&self) -> Option<usize> {
        self.bytes
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes.is_none()
    }

    /// Bytes still available when `live` bytes are in use.
    pub fn available(&self, live: usize) -> usize {
        match self.bytes {
            Some(limit) => limit.saturating_sub(live),
            None => usize::MAX - live,
        }
    }

    /// Whether `requested` more bytes fit on top of `live`.
    pub fn admits(&self, live: usize, requested: usize) -> bool {
        match self.bytes {
            Some(limit) => live
                .checked_add(requested)
                .is_some_and(|total| total <= limit),
            None => live.checked_add(requested).is_some(),
        }
    }

    /// Parses a human-readable capacity string.
    pub fn parse(s: &str) -> Result<Self, MemoryError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MemoryError::InvalidCapacity("empty capacity string".into()));
        }
        if trimmed.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::unlimited());
        }

        let upper = trimmed.to_ascii_uppercase();
        let (digits, multiplier) = SUFFIXES
            .iter()
            .find(|(suffix, _)| upper.ends_with(suffix))
            .map(|(suffix, mult)| (&trimmed[..trimmed.len() - suffix.len()], *mult))
            .unwrap_or((trimmed, 1));

        let value: usize = digits.trim().parse().map_err(|_| {
            MemoryError::InvalidCapacity(format!(
                "'{trimmed}': expected a number with an optional K/M/G suffix, or 'unlimited'"
            ))
        })?;
        let bytes = value
            .checked_mul(multiplier)
            .ok_or_else(|| MemoryError::InvalidCapacity(format!("'{trimmed}' overflows")))?;
        Ok(Self::from_bytes(bytes))
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(bytes) = self.bytes else {
            return f.write_str("unlimited");
        };
        if bytes >= GB && bytes % GB == 0 {
            write!(f, "{}G", bytes / GB)
        } else if bytes >= MB && bytes % MB == 0 {
            write!(f, "{}M", bytes / MB)
        } else if bytes >= KB && bytes % KB == 0 {
            write!(f, "{}K", bytes / KB)
        } else {
            write!(f, "{bytes}B")
        }
    }
}

impl TryFrom<String> for Capacity {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Capacity> for String {
    fn from(value: Capacity) -> Self {
        value.to_string()
    }
}
