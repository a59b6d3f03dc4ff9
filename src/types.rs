// src/types.rs - Scalar ids shared with the native engine
use std::fmt;

/// Index of a parallel sequence slot known to the native engine
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceId(pub i32);

impl SequenceId {
    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq#{}", self.0)
    }
}

impl From<i32> for SequenceId {
    fn from(value: i32) -> Self {
        SequenceId(value)
    }
}

/// Position of an item within its sequence.
///
/// Normally increases by one per token, but cache-shift operations may move it backwards,
/// so it stays signed.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position(pub i32);

impl Position {
    pub fn value(self) -> i32 {
        self.0
    }

    /// Position shifted by `delta` (may be negative), `None` on `i32` overflow
    pub fn checked_offset(self, delta: i32) -> Option<Position> {
        self.0.checked_add(delta).map(Position)
    }
}

impl From<i32> for Position {
    fn from(value: i32) -> Self {
        Position(value)
    }
}

/// Discrete vocabulary id
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token(pub i32);

impl From<i32> for Token {
    fn from(value: i32) -> Self {
        Token(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_native_ints() {
        assert_eq!(std::mem::size_of::<SequenceId>(), std::mem::size_of::<i32>());
        assert_eq!(std::mem::size_of::<Position>(), std::mem::size_of::<i32>());
        assert_eq!(std::mem::size_of::<Token>(), std::mem::size_of::<i32>());
    }

    #[test]
    fn test_position_shift_backwards() {
        assert_eq!(Position(10).checked_offset(-4), Some(Position(6)));
        assert_eq!(Position(0).checked_offset(-1).map(Position::value), Some(-1));
    }

    #[test]
    fn test_position_overflow_is_none() {
        assert_eq!(Position(i32::MAX).checked_offset(1), None);
        assert_eq!(Position(i32::MIN).checked_offset(-1), None);
        assert_eq!(Position(i32::MAX - 1).checked_offset(1), Some(Position(i32::MAX)));
    }
}
