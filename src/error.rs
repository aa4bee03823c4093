use std::fmt;

/// Caller-observable failure classes. Every mutator fails before touching
/// any account state, so callers never need a rollback after an `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// balance/BRC/frozen-pool subtraction below zero.
    InsufficientFunds,
    /// ballot subtraction below zero.
    InsufficientBallot,
    /// poll subtraction below zero.
    InsufficientPoll,
    /// vote retraction exceeds the recorded votes for that receiver.
    InsufficientVoteLog,
    /// operation targets a missing account and may not create one.
    InvalidAddress,
    /// system-vote removal on a missing system account.
    InvalidSystemAddress,
    /// the domain start nonce was used before being set, or set twice to
    /// different values.
    InvalidAccountStartNonce,
    DatabaseAlreadyOpen,
    NotEnoughAvailableSpace,
    /// the operation was compiled out (e.g. full-DB iteration).
    InterfaceNotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InsufficientFunds => "not enough funds",
            ErrorKind::InsufficientBallot => "not enough ballots",
            ErrorKind::InsufficientPoll => "not enough polls",
            ErrorKind::InsufficientVoteLog => "not enough recorded votes",
            ErrorKind::InvalidAddress => "no account at address",
            ErrorKind::InvalidSystemAddress => "no system account at address",
            ErrorKind::InvalidAccountStartNonce => {
                "account start nonce unset or conflicting"
            }
            ErrorKind::DatabaseAlreadyOpen => "state database already open",
            ErrorKind::NotEnoughAvailableSpace => {
                "not enough disk space for the state database"
            }
            ErrorKind::InterfaceNotSupported => "interface not supported",
        };
        f.write_str(s)
    }
}

/// An [ErrorKind] plus the name of the operation that raised it, kept
/// around purely for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    interface: &'static str,
}

impl Error {
    pub fn new(kind: ErrorKind, interface: &'static str) -> Self {
        Self { kind, interface }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in {})", self.kind, self.interface)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn test_error_display() {
    let e = Error::new(ErrorKind::InsufficientFunds, "State::sub_balance");
    assert_eq!(e.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(format!("{}", e), "not enough funds (in State::sub_balance)");
}
