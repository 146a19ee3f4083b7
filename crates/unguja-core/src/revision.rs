//! Opaque, comparable consistency tokens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A point-in-time token advertised by a datastore.
///
/// The engine only ever compares revisions; it never inspects their value.
/// The in-memory backend issues dense sequence numbers, other backends may
/// map whatever ordered token they have onto this type.
///
/// For any two revisions `r1 <= r2`, the snapshot at `r2` contains every
/// write visible at `r1`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Revision(u64);

impl Revision {
    /// The revision before any write.
    pub const ZERO: Revision = Revision(0);

    pub fn from_sequence(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }

    /// The next revision in sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Revision {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Revision)
            .map_err(|_| CoreError::InvalidRevision {
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_sequence() {
        let r1 = Revision::from_sequence(1);
        let r2 = Revision::from_sequence(2);
        assert!(r1 < r2);
        assert_eq!(r1.next(), r2);
    }

    #[test]
    fn round_trips_through_string() {
        let r = Revision::from_sequence(42);
        assert_eq!(r.to_string().parse::<Revision>().unwrap(), r);
        assert!("not-a-revision".parse::<Revision>().is_err());
    }
}
