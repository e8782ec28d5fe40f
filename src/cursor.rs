// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change log cursor for shape subscriptions.
//!
//! A cursor is the pair of a server-issued shape handle and an offset into
//! that shape's change log. The ingestion task sends it on every request so
//! the source can resume delivery after a disconnect.
//!
//! # Offset Format
//!
//! Offsets are written `{lsn}_{op_index}` (e.g. `"26800584_4"`). The special
//! offset `"-1"` means "before the beginning": a request at `-1` asks for a
//! full snapshot.
//!
//! ```text
//! -1  <  0_0  <  0_7  <  1200_0  <  1200_3
//! ```
//!
//! # Cursor Semantics
//!
//! The cursor stores the offset of the **last fully applied** change. It is
//! only advanced while holding the local store's write lock, in the same
//! critical section that mutates the base rows, so observers never see a
//! cursor that is ahead of the state it describes.
//!
//! ```text
//! receive batch -> apply to base -> advance cursor   (one critical section)
//!                  (disconnect before here = batch is re-requested)
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Position in a shape's change log.
///
/// Derived ordering puts [`Offset::Initial`] before every log position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Offset {
    /// Before the first entry. Requesting from here yields a full snapshot.
    #[default]
    Initial,
    /// A position in the log.
    Log { lsn: u64, op: u64 },
}

impl Offset {
    /// Create a log offset.
    pub fn new(lsn: u64, op: u64) -> Self {
        Offset::Log { lsn, op }
    }

    /// Check if this is the initial (snapshot) offset.
    pub fn is_initial(&self) -> bool {
        matches!(self, Offset::Initial)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Initial => f.write_str("-1"),
            Offset::Log { lsn, op } => write!(f, "{}_{}", lsn, op),
        }
    }
}

/// Error returned when an offset string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid offset: {0:?}")]
pub struct ParseOffsetError(pub String);

impl FromStr for Offset {
    type Err = ParseOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "-1" {
            return Ok(Offset::Initial);
        }
        let (lsn, op) = s
            .split_once('_')
            .ok_or_else(|| ParseOffsetError(s.to_string()))?;
        let lsn = lsn.parse().map_err(|_| ParseOffsetError(s.to_string()))?;
        let op = op.parse().map_err(|_| ParseOffsetError(s.to_string()))?;
        Ok(Offset::Log { lsn, op })
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compare two offset strings.
///
/// Malformed strings sort as [`Offset::Initial`], so a garbage offset is
/// never considered ahead of a real one.
pub fn compare_offsets(a: &str, b: &str) -> Ordering {
    let a: Offset = a.parse().unwrap_or_default();
    let b: Offset = b.parse().unwrap_or_default();
    a.cmp(&b)
}

/// Replication position for one shape subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShapeCursor {
    /// Server-issued shape handle. `None` until the first response.
    pub handle: Option<String>,
    /// Last fully applied offset.
    pub offset: Offset,
    /// When the cursor last moved (ms since epoch). Zero if never.
    #[serde(default)]
    pub updated_at: i64,
}

impl ShapeCursor {
    /// A cursor that requests a fresh snapshot.
    pub fn start() -> Self {
        Self::default()
    }

    /// Check if this cursor would request a snapshot.
    pub fn is_initial(&self) -> bool {
        self.offset.is_initial()
    }

    /// Move the cursor forward.
    ///
    /// Offsets never go backwards; an older offset leaves the position
    /// unchanged. Returns `true` if the offset moved.
    pub fn advance(&mut self, handle: Option<&str>, offset: Offset) -> bool {
        if let Some(h) = handle {
            if self.handle.as_deref() != Some(h) {
                self.handle = Some(h.to_string());
            }
        }
        if offset > self.offset {
            self.offset = offset;
            self.updated_at = chrono::Utc::now().timestamp_millis();
            true
        } else {
            false
        }
    }
}

impl fmt::Display for ShapeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handle {
            Some(h) => write!(f, "{}@{}", h, self.offset),
            None => write!(f, "{}", self.offset),
        }
    }
}
