// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Memory space tags.

use std::fmt;

/// Where a buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySpace {
    /// Host RAM, directly addressable by the CPU.
    Host,
    /// Accelerator memory, reachable only through copies.
    Device,
}

impl MemorySpace {
    /// Returns a human-readable label.
    pub fn as_str(self) -> &'static str {
        match self {
            MemorySpace::Host => "host",
            MemorySpace::Device => "device",
        }
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
