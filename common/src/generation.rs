// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generation numbers used for optimistic concurrency on drive records.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Generation number of a stored record.
///
/// Every accepted write to a record bumps its generation. A conditional
/// update names the generation the writer last observed; if the store has
/// moved on, the write is rejected and the writer must reread.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(try_from = "u64", into = "u64")]
pub struct Generation(u64);

#[derive(Debug, thiserror::Error)]
#[error("generation numbers start at 1 (got {0})")]
pub struct InvalidGeneration(u64);

impl Generation {
    pub const fn new() -> Generation {
        Generation(1)
    }

    pub fn next(&self) -> Generation {
        // It should technically be an operational error if this wraps. But it
        // seems unlikely enough to happen in practice that we can probably
        // feel safe with this.
        let next_gen = self.0 + 1;
        assert!(next_gen <= u64::try_from(i64::MAX).unwrap());
        Generation(next_gen)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation::new()
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(&self.0.to_string())
    }
}

impl From<Generation> for u64 {
    fn from(g: Generation) -> Self {
        g.0
    }
}

impl TryFrom<u64> for Generation {
    type Error = InvalidGeneration;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            return Err(InvalidGeneration(value));
        }
        Ok(Generation(value))
    }
}
