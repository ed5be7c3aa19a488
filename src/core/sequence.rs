//! Compound sequence identifiers and their wire encoding.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Compound sequence identifier carried on the changes wire.
///
/// `seq` is the entry's own sequence. `triggered_by` is nonzero when the
/// entry is being re-sent because of a later access grant (its value is the
/// grant's sequence). `low_seq` is the highest sequence below which every
/// sequence has been either cached or abandoned at the time of emission;
/// a client resuming from `low_seq` cannot miss a late arrival.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SequenceId {
    pub seq: u64,
    pub triggered_by: u64,
    pub low_seq: u64,
}

impl SequenceId {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            triggered_by: 0,
            low_seq: 0,
        }
    }

    /// The sequence a client can safely resume from without missing late
    /// arrivals: the low-sequence floor when one was attached, else `seq`.
    pub fn safe_sequence(self) -> u64 {
        if self.low_seq > 0 { self.low_seq } else { self.seq }
    }

    /// The position this identifier occupies in the merged stream. Grant
    /// re-sends sort at their grant sequence, not their original one.
    fn effective(self) -> u64 {
        if self.triggered_by > 0 {
            self.triggered_by
        } else {
            self.seq
        }
    }
}

/// Total order over the merged changes stream.
///
/// Grant re-sends (`triggered_by` nonzero) sort just before the untriggered
/// entry at the grant position, so a backfilled channel's history lands
/// immediately ahead of the grant itself.
impl Ord for SequenceId {
    fn cmp(&self, other: &Self) -> Ordering {
        let key = |s: &SequenceId| {
            (
                s.effective(),
                s.triggered_by == 0,
                s.seq,
                s.triggered_by,
                s.low_seq,
            )
        };
        key(self).cmp(&key(other))
    }
}

impl PartialOrd for SequenceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low_seq > 0 && self.low_seq < self.seq {
            if self.triggered_by > 0 {
                write!(f, "{}:{}:{}", self.low_seq, self.triggered_by, self.seq)
            } else {
                write!(f, "{}::{}", self.low_seq, self.seq)
            }
        } else if self.triggered_by > 0 {
            write!(f, "{}:{}", self.triggered_by, self.seq)
        } else {
            write!(f, "{}", self.seq)
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseSequenceError {
    #[error("empty sequence component")]
    Empty,
    #[error("sequence component {component:?} is not a decimal number")]
    NotANumber { component: String },
    #[error("sequence component {component:?} has a leading zero")]
    LeadingZero { component: String },
    #[error("sequence {input:?} has too many components")]
    TooManyComponents { input: String },
}

fn parse_component(component: &str, allow_empty: bool) -> Result<u64, ParseSequenceError> {
    if component.is_empty() {
        if allow_empty {
            return Ok(0);
        }
        return Err(ParseSequenceError::Empty);
    }
    if component.len() > 1 && component.starts_with('0') {
        return Err(ParseSequenceError::LeadingZero {
            component: component.to_string(),
        });
    }
    component
        .parse::<u64>()
        .map_err(|_| ParseSequenceError::NotANumber {
            component: component.to_string(),
        })
}

impl FromStr for SequenceId {
    type Err = ParseSequenceError;

    /// Accepts `"S"`, `"T:S"`, `"L::S"`, and `"L:T:S"`. Only the middle
    /// component of the three-part form may be empty.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let components: Vec<&str> = input.split(':').collect();
        let mut id = SequenceId::default();
        match components.as_slice() {
            [seq] => {
                id.seq = parse_component(seq, false)?;
            }
            [triggered_by, seq] => {
                id.triggered_by = parse_component(triggered_by, false)?;
                id.seq = parse_component(seq, false)?;
            }
            [low_seq, triggered_by, seq] => {
                id.low_seq = parse_component(low_seq, false)?;
                id.triggered_by = parse_component(triggered_by, true)?;
                id.seq = parse_component(seq, false)?;
            }
            _ => {
                return Err(ParseSequenceError::TooManyComponents {
                    input: input.to_string(),
                });
            }
        }
        Ok(id)
    }
}

impl Serialize for SequenceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SequenceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(DeError::custom)
    }
}
