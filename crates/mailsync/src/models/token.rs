//! Sync token: the client-visible two-part cursor
//!
//! A token is `"<last_change_id>:<last_delete_seq>"`. The two halves are
//! positions in two independent sequences and carry no ordering relationship
//! to each other. A delete sequence of `-1` means no deletion has been
//! observed yet.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::{ChangeId, DeleteSeq};
use crate::error::SyncError;

/// Delimiter between the two halves of an encoded token
const DELIMITER: char = ':';

/// Delete sequence of a client that has not observed any deletion
pub const NO_DELETES: DeleteSeq = -1;

/// Cursor into a mailbox's change log and tombstone log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncToken {
    pub last_change_id: ChangeId,
    pub last_delete_seq: DeleteSeq,
}

impl SyncToken {
    pub fn new(last_change_id: ChangeId, last_delete_seq: DeleteSeq) -> Self {
        Self {
            last_change_id,
            last_delete_seq,
        }
    }

    /// The high-water mark of an empty mailbox
    pub fn initial() -> Self {
        Self::new(0, NO_DELETES)
    }

    /// Encode as the opaque token string handed to clients
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.last_change_id, DELIMITER, self.last_delete_seq)
    }

    /// Decode a token string, rejecting anything that is not exactly what
    /// [`SyncToken::encode`] produces
    pub fn decode(token: &str) -> Result<Self, SyncError> {
        let invalid = |reason: &str| SyncError::InvalidToken {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let (change, delete) = token
            .split_once(DELIMITER)
            .ok_or_else(|| invalid("missing delimiter"))?;
        if delete.contains(DELIMITER) {
            return Err(invalid("too many components"));
        }

        let last_change_id = parse_component(change).map_err(|r| invalid(&r))?;
        let last_delete_seq = parse_component(delete).map_err(|r| invalid(&r))?;

        if last_change_id < 0 {
            return Err(invalid("change id is negative"));
        }
        if last_delete_seq < NO_DELETES {
            return Err(invalid("delete sequence is below -1"));
        }

        Ok(Self::new(last_change_id, last_delete_seq))
    }

    /// Whether either half of this token is past the matching half of `mark`
    ///
    /// A token ahead of the mailbox's high-water mark was not issued by this
    /// mailbox (or the mailbox lost data) and cannot be resumed from.
    pub fn is_ahead_of(&self, mark: &SyncToken) -> bool {
        self.last_change_id > mark.last_change_id || self.last_delete_seq > mark.last_delete_seq
    }

    /// Whether both halves are at or past the matching halves of `other`
    pub fn covers(&self, other: &SyncToken) -> bool {
        self.last_change_id >= other.last_change_id && self.last_delete_seq >= other.last_delete_seq
    }
}

/// Parse one decimal component: optional leading `-`, then ASCII digits
/// without leading zeros
fn parse_component(s: &str) -> Result<i64, String> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() {
        return Err("empty component".to_string());
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("component {:?} is not a decimal integer", s));
    }
    if digits.starts_with('0') && (digits.len() > 1 || s.starts_with('-')) {
        return Err(format!("component {:?} is not in canonical form", s));
    }
    s.parse::<i64>()
        .map_err(|_| format!("component {:?} is out of range", s))
}

impl Default for SyncToken {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for SyncToken {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for SyncToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for SyncToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_token() {
        assert_eq!(SyncToken::initial().encode(), "0:-1");
    }

    #[test]
    fn test_decode_valid() {
        assert_eq!(SyncToken::decode("0:-1").unwrap(), SyncToken::new(0, -1));
        assert_eq!(SyncToken::decode("42:7").unwrap(), SyncToken::new(42, 7));
        assert_eq!(
            SyncToken::decode("9223372036854775807:0").unwrap(),
            SyncToken::new(i64::MAX, 0)
        );
    }

    #[test]
    fn test_encode_decode_preserves_extremes() {
        let token = SyncToken::new(i64::MAX, i64::MAX);
        assert_eq!(SyncToken::decode(&token.encode()).unwrap(), token);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for bad in [
            "", "12", ":", "12:", ":3", "12:3:4", "a:1", "1:b", "+1:2", "1:+2", " 1:2", "1:2 ",
            "1.5:2", "--1:2", "1_000:2", "0x10:1", "007:1", "-0:1", "1:-0",
        ] {
            let err = SyncToken::decode(bad).unwrap_err();
            assert!(
                matches!(err, SyncError::InvalidToken { .. }),
                "expected InvalidToken for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        assert!(SyncToken::decode("-1:-1").is_err());
        assert!(SyncToken::decode("5:-2").is_err());
        assert!(SyncToken::decode("9223372036854775808:0").is_err());
    }

    #[test]
    fn test_ahead_of_high_water_mark() {
        let mark = SyncToken::new(10, 3);
        assert!(!SyncToken::new(10, 3).is_ahead_of(&mark));
        assert!(!SyncToken::new(4, -1).is_ahead_of(&mark));
        assert!(SyncToken::new(11, 3).is_ahead_of(&mark));
        assert!(SyncToken::new(2, 4).is_ahead_of(&mark));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let token = SyncToken::new(17, 4);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "\"17:4\"");
        let back: SyncToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
        assert!(serde_json::from_str::<SyncToken>("\"17-4\"").is_err());
    }
}
