use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

/// The error taxonomy every backend implementation maps into
///
/// Executors and the retry loop dispatch on these kinds: transient
/// kinds re-enter the retry path, permission and validation kinds are
/// per-resource terminal, invariant kinds abort the run.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum BackendErrorKind {
    #[fail(display = "resource '{}' not found", _0)]
    NotFound(String),

    #[fail(display = "permission denied on '{}'", _0)]
    PermissionDenied(String),

    #[fail(display = "conflict on '{}': {}", _0, _1)]
    Conflict(String, String),

    #[fail(display = "transient backend failure: {}", _0)]
    Transient(String),

    #[fail(display = "backend call timed out after {}s", _0)]
    Timeout(u64),

    #[fail(display = "sql error [{}]: {}", _0, _1)]
    Sql(String, String),

    #[fail(display = "backend rejected the request: {}", _0)]
    Validation(String),

    #[fail(display = "internal invariant violated: {}", _0)]
    Invariant(String),
}

/// Failure error wrapping a `BackendErrorKind` context
#[derive(Debug)]
pub struct BackendError {
    inner: Context<BackendErrorKind>,
}

impl Fail for BackendError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl From<BackendErrorKind> for BackendError {
    fn from(kind: BackendErrorKind) -> BackendError {
        BackendError {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<BackendErrorKind>> for BackendError {
    fn from(inner: Context<BackendErrorKind>) -> BackendError {
        BackendError { inner }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl BackendError {
    pub fn kind(&self) -> &BackendErrorKind {
        self.inner.get_context()
    }

    pub fn not_found(what: &str) -> BackendError {
        BackendErrorKind::NotFound(what.into()).into()
    }

    pub fn permission_denied(what: &str) -> BackendError {
        BackendErrorKind::PermissionDenied(what.into()).into()
    }

    pub fn transient(msg: &str) -> BackendError {
        BackendErrorKind::Transient(msg.into()).into()
    }

    pub fn invariant(msg: &str) -> BackendError {
        BackendErrorKind::Invariant(msg.into()).into()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), BackendErrorKind::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self.kind(), BackendErrorKind::PermissionDenied(_))
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self.kind(), BackendErrorKind::Invariant(_))
    }

    /// Whether the retry loop should take another attempt
    ///
    /// Timeouts count as transient; sql errors are re-classified by
    /// sqlstate first.
    pub fn is_transient(&self) -> bool {
        match self.kind() {
            BackendErrorKind::Transient(_) | BackendErrorKind::Timeout(_) => true,
            BackendErrorKind::Sql(state, msg) => {
                matches!(classify_sql(state, msg), BackendErrorKind::Transient(_))
            }
            _ => false,
        }
    }
}

/// Classify a sql error into the taxonomy via sqlstate and message
///
/// 42xxx states are syntax/authorization, 08xxx connection failures,
/// HYT00/57014 timeouts. Unknown states fall back on message sniffing.
pub fn classify_sql(sqlstate: &str, message: &str) -> BackendErrorKind {
    let upper = message.to_uppercase();
    if sqlstate.starts_with("08") || sqlstate == "57P01" {
        return BackendErrorKind::Transient(message.into());
    }
    if sqlstate == "HYT00" || sqlstate == "57014" {
        return BackendErrorKind::Timeout(0);
    }
    if sqlstate == "42501" || upper.contains("PERMISSION DENIED") || upper.contains("NOT AUTHORIZED")
    {
        return BackendErrorKind::PermissionDenied(message.into());
    }
    if sqlstate.starts_with("42") {
        return BackendErrorKind::Validation(message.into());
    }
    if upper.contains("RATE LIMIT") || upper.contains("THROTTL") || upper.contains("UNAVAILABLE") {
        return BackendErrorKind::Transient(message.into());
    }
    BackendErrorKind::Sql(sqlstate.into(), message.into())
}

#[cfg(test)]
mod tests {
    use super::{classify_sql, BackendError, BackendErrorKind};

    #[test]
    fn transient_classification() {
        assert!(BackendError::transient("rate limited").is_transient());
        assert!(BackendError::from(BackendErrorKind::Timeout(60)).is_transient());
        assert!(!BackendError::permission_denied("cat").is_transient());
        assert!(!BackendError::not_found("cat").is_transient());
    }

    #[test]
    fn sqlstate_classification() {
        assert_eq!(
            classify_sql("08006", "connection reset"),
            BackendErrorKind::Transient("connection reset".into())
        );
        assert_eq!(
            classify_sql("42501", "permission denied on table"),
            BackendErrorKind::PermissionDenied("permission denied on table".into())
        );
        match classify_sql("42601", "syntax error at FROM") {
            BackendErrorKind::Validation(_) => {}
            other => panic!("expected validation, got {:?}", other),
        }
        match classify_sql("XX000", "who knows") {
            BackendErrorKind::Sql(state, _) => assert_eq!(state, "XX000"),
            other => panic!("expected sql passthrough, got {:?}", other),
        }
    }

    #[test]
    fn sql_errors_can_be_transient() {
        let e = BackendError::from(BackendErrorKind::Sql(
            "XX000".into(),
            "service unavailable, retry".into(),
        ));
        assert!(e.is_transient());
    }
}
