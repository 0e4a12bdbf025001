use std::cell::RefCell;

use thiserror::Error;

/// Stable error category, independent of the message text.
///
/// Drivers map backend-specific failures onto these codes so callers can
/// branch on the kind of failure without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Target key or collection is absent.
    NotFound,
    /// Malformed rule tree, missing `id`, unknown operator, wrong shape.
    InvalidArgument,
    /// JSON encode/decode failure.
    Serialization,
    /// Reserved; not emitted by the bundled driver.
    Conflict,
    /// Unrecoverable backend error, including exhausted busy retries.
    Internal,
}

/// Store operation errors.
///
/// All façade and driver operations return this error type so callers get
/// consistent error handling regardless of the storage backend.
#[derive(Debug, Clone, Error)]
pub enum PersistError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PersistError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Serialization(_) => ErrorCode::Serialization,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::InvalidArgument(m)
            | Self::Serialization(m)
            | Self::Conflict(m)
            | Self::Internal(m) => m,
        }
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, String)>> = const { RefCell::new(None) };
}

/// Returns the calling thread's last recorded error, if any.
///
/// The slot is thread-local: failures on other threads are never visible
/// here. It lives until overwritten by the next failure on this thread;
/// successful operations neither read nor clear it. The slot is not handed
/// across threads -- callers that move work between threads must carry the
/// `PersistError` value itself.
pub fn last_error() -> Option<(ErrorCode, String)> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Records `err` in the calling thread's error slot, replacing any prior
/// entry.
pub fn set_last_error(err: &PersistError) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some((err.code(), err.message().to_string()));
    });
}

/// Records the error in the thread-local slot on the failure path.
///
/// Every failing public operation funnels through this so that
/// `last_error()` always reflects the most recent failure on the thread.
pub trait ResultExt<T> {
    fn record_err(self) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn record_err(self) -> Result<T> {
        if let Err(ref err) = self {
            set_last_error(err);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_tracks_most_recent_failure() {
        let first = PersistError::not_found("users[u1]");
        set_last_error(&first);
        assert_eq!(
            last_error(),
            Some((ErrorCode::NotFound, "users[u1]".to_string()))
        );

        let second = PersistError::invalid_argument("bad rule");
        set_last_error(&second);
        let (code, message) = last_error().expect("slot should be populated");
        assert_eq!(code, ErrorCode::InvalidArgument);
        assert_eq!(message, "bad rule");
    }

    #[test]
    fn record_err_passes_success_through_untouched() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.record_err().unwrap(), 7);
    }

    #[test]
    fn error_slots_are_per_thread() {
        set_last_error(&PersistError::internal("main thread"));

        let seen = std::thread::spawn(|| {
            assert!(last_error().is_none());
            set_last_error(&PersistError::not_found("worker thread"));
            last_error()
        })
        .join()
        .unwrap();

        assert_eq!(seen, Some((ErrorCode::NotFound, "worker thread".into())));
        assert_eq!(
            last_error(),
            Some((ErrorCode::Internal, "main thread".into()))
        );
    }
}
