//! Sync cursor grammar shared by every resumable job.
//!
//! A cursor is a compact string persisted in the checkpoint fields under the
//! `cursor` key. Two phases exist:
//!
//! - `bootstrap:OFFSET` while the initial full sweep is still in flight
//! - `deltaSince:SINCE_MILLIS` or `deltaSince:SINCE_MILLIS:OFFSET` once the
//!   source has been swept at least once
//!
//! Decoding is deliberately forgiving. A cursor that does not parse means a
//! stale or hand-edited checkpoint, and the safe recovery is to start a fresh
//! bootstrap rather than refuse to run. Duplicate work is acceptable, lost
//! records are not.

use tracing::warn;

use crate::checkpoint::{CURSOR_FIELD, CheckpointFields};

/// Where a sync run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Initial full sweep, paused at `offset` records in.
    Bootstrap {
        offset: u64,
    },
    /// Incremental sweep over changes since `since_millis`, paused at
    /// `offset` records into the current sweep.
    Delta {
        since_millis: i64,
        offset: u64,
    },
}

impl Cursor {
    /// The cursor a source starts from when it has never been synced.
    #[must_use]
    pub fn fresh() -> Self {
        Self::Bootstrap { offset: 0 }
    }

    /// Serializes the cursor. A delta cursor at offset zero omits the
    /// trailing offset segment, matching what exhaustion writes.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Bootstrap { offset } => format!("bootstrap:{offset}"),
            Self::Delta {
                since_millis,
                offset: 0,
            } => format!("deltaSince:{since_millis}"),
            Self::Delta {
                since_millis,
                offset,
            } => format!("deltaSince:{since_millis}:{offset}"),
        }
    }

    /// Parses a cursor string, or `None` when it does not follow the
    /// grammar.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        if let Some(digits) = raw.strip_prefix("bootstrap:") {
            let offset = digits.parse().ok()?;
            return Some(Self::Bootstrap { offset });
        }

        if let Some(rest) = raw.strip_prefix("deltaSince:") {
            return match rest.split_once(':') {
                None => {
                    let since_millis = rest.parse().ok()?;
                    Some(Self::Delta {
                        since_millis,
                        offset: 0,
                    })
                }
                Some((since, offset)) => {
                    let since_millis = since.parse().ok()?;
                    let offset = offset.parse().ok()?;
                    Some(Self::Delta {
                        since_millis,
                        offset,
                    })
                }
            };
        }

        None
    }

    /// Reads the cursor out of checkpoint fields. A missing checkpoint or a
    /// missing cursor key starts a silent fresh bootstrap; a cursor that is
    /// present but unreadable also starts fresh, with a warning.
    #[must_use]
    pub fn from_fields(fields: Option<&CheckpointFields>) -> Self {
        let Some(raw) = fields.and_then(|f| f.get(CURSOR_FIELD)) else {
            return Self::fresh();
        };

        let parsed = raw.as_str().and_then(Self::decode);
        match parsed {
            Some(cursor) => cursor,
            None => {
                warn!(cursor = %raw, "unreadable sync cursor, restarting from a fresh bootstrap");
                Self::fresh()
            }
        }
    }

    /// The `since` filter this cursor asks the source for.
    #[must_use]
    pub fn since_millis(&self) -> Option<i64> {
        match self {
            Self::Bootstrap { .. } => None,
            Self::Delta { since_millis, .. } => Some(*since_millis),
        }
    }

    /// The record offset this cursor resumes at.
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Bootstrap { offset } | Self::Delta { offset, .. } => *offset,
        }
    }

    /// The same phase, moved to a new offset.
    #[must_use]
    pub fn at_offset(&self, offset: u64) -> Self {
        match self {
            Self::Bootstrap { .. } => Self::Bootstrap { offset },
            Self::Delta { since_millis, .. } => Self::Delta {
                since_millis: *since_millis,
                offset,
            },
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}
