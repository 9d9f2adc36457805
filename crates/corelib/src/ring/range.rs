//! Token ranges on the ring.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::token::Token;

/// Half-open arc `(start, end]` walked clockwise.
///
/// A range whose `start` equals its `end` covers the whole ring; this is the
/// range owned by the only token of a single-vnode ring.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    pub fn new(start: Token, end: Token) -> Self {
        Self { start, end }
    }

    /// The range covering every token.
    pub fn full() -> Self {
        Self::new(Token::MIN, Token::MIN)
    }

    pub fn is_full(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, token: Token) -> bool {
        if self.is_full() {
            true
        } else if self.start < self.end {
            self.start < token && token <= self.end
        } else {
            token > self.start || token <= self.end
        }
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}
