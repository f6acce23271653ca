// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A way to tag an error with the domain-level kind the core's callers need to branch on
//    (malformed-ws, certification-fail, bf-abort, ...) without giving up the backtrace above.

use std::borrow::Cow;
use std::fmt;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Domain-level error kinds, per the error handling design: each names a
/// distinct recovery path the coordinator or façade takes, not a Rust type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Decode failed: action is skipped, queues advance via self-cancel.
    MalformedWs,
    /// Expected outcome, reported to the local path as "must rollback".
    CertificationFail,
    /// Local trx is the victim of a brute-force abort.
    BfAbort,
    /// `last_seen_trx < purged_up_to`; treated as certification-fail.
    CertBoundViolated,
    /// GCS send/recv failure.
    Transport,
    /// Queue would overflow; EAGAIN with bounded retry.
    Capacity,
    /// State invariant broken; the process aborts after logging.
    Fatal,
}

impl ErrorKind {
    pub fn is_certification_fail(self) -> bool {
        matches!(self, ErrorKind::CertificationFail | ErrorKind::CertBoundViolated)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedWs => "malformed-ws",
            ErrorKind::CertificationFail => "certification-fail",
            ErrorKind::BfAbort => "bf-abort",
            ErrorKind::CertBoundViolated => "cert-bound-violated",
            ErrorKind::Transport => "transport",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error {
    inner: DynBacktraceError,
    kind: Option<ErrorKind>,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        error!(target: "galera", "{:?}", err);
        let inner = DynBacktraceError::from(err);
        Error { inner, kind: None }
    }

    /// The domain-level kind this error was tagged with via [`err_kind`], if
    /// any. Errors built from foreign types (via `From`) carry no kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(err)
}

/// Build an [`Error`] tagged with a domain-level [`ErrorKind`] so that
/// callers downstream (the coordinator, the façade) can branch on it instead
/// of matching message text.
pub fn err_kind(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let mut e = err(msg);
    e.kind = Some(kind);
    e
}

#[test]
fn test_error() {
    let _err = err("test error");
}

#[test]
fn test_error_kind_roundtrip() {
    let e = err_kind(ErrorKind::CertificationFail, "conflict");
    assert_eq!(e.kind(), Some(ErrorKind::CertificationFail));
}
