use std::fmt;

/// Three digit status code that starts every response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    /// Caller must ensure `100 <= code <= 999` holds for wire codes; the
    /// parser only produces values in that range.
    pub const fn new(code: u16) -> StatusCode {
        StatusCode(code)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Leading digit: 1 preliminary, 2 success, 3 continue, 4 transient, 5 permanent.
    pub fn class(self) -> u16 {
        self.0 / 100
    }

    pub fn is_preliminary(self) -> bool {
        self.class() == 1
    }

    /// Whether this code ends an exchange in the RFC 2229 sense.
    pub fn is_completion(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }

    /// Server reported a temporary condition; the exchange ends without a result.
    pub fn is_soft_error(self) -> bool {
        self == SERVER_OFFLINE || self == SERVER_PROBLEM
    }

    /// Preliminary codes announcing a dot-terminated text block.
    pub fn announces_text(self) -> bool {
        TEXT_FOLLOWS.contains(&self)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

pub const DATABASE_LIST: StatusCode = StatusCode(110);
pub const STRATEGY_LIST: StatusCode = StatusCode(111);
pub const DATABASE_INFO: StatusCode = StatusCode(112);
pub const HELP_TEXT: StatusCode = StatusCode(113);
pub const SERVER_INFO: StatusCode = StatusCode(114);
pub const DEFINITION_FOLLOWS: StatusCode = StatusCode(151);
pub const MATCH_LIST: StatusCode = StatusCode(152);

pub const SERVER_BANNER: StatusCode = StatusCode(220);
pub const CLOSING: StatusCode = StatusCode(221);
pub const OK: StatusCode = StatusCode(250);

pub const SERVER_OFFLINE: StatusCode = StatusCode(420);
pub const SERVER_PROBLEM: StatusCode = StatusCode(421);

const TEXT_FOLLOWS: [StatusCode; 7] = [
    DATABASE_LIST,
    STRATEGY_LIST,
    DATABASE_INFO,
    HELP_TEXT,
    SERVER_INFO,
    DEFINITION_FOLLOWS,
    MATCH_LIST,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_on_classes() {
        assert!(DEFINITION_FOLLOWS.is_preliminary());
        assert!(DEFINITION_FOLLOWS.announces_text());
        assert!(!StatusCode::new(150).announces_text());
        assert!(OK.is_completion());
        assert!(StatusCode::new(552).is_completion());
        assert!(SERVER_OFFLINE.is_soft_error());
        assert!(!StatusCode::new(500).is_soft_error());
        assert_eq!(SERVER_BANNER.to_string(), "220");
    }
}
