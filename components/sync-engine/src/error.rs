//! The error taxonomy from section 7. Each kind documents who handles it and
//! what the caller should expect: most of these are not "the engine is
//! broken", they're routine control-flow signals consumed by the
//! subscription state machine or the outbox's retry policy.

use error_support::{ErrorHandling, GetErrorHandling};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The originating transaction's scope didn't include the pending-ops
    /// (or tombstones) tables. The caller's write is rolled back.
    #[error("write capture is not atomic with its transaction")]
    NonAtomicCapture,

    /// Validation, oversize or auth failure reported by the provider.
    /// Terminal: the op moves to `failed` and is never retried.
    #[error("push failed permanently: {0}")]
    PushPermanentFailure(String),

    /// Network, rate-limit, server or conflict failure. Retried with
    /// backoff until `retryDelays` is exhausted, then becomes permanent.
    #[error("push failed transiently: {0}")]
    PushTransientFailure(String),

    /// 401/403 from the provider. The subscription stops; the host is
    /// expected to listen for `sync.subscription:sessionInvalid`.
    #[error("session is no longer valid")]
    SessionInvalid,

    /// `isPotentiallyExpired()` tripped. Recovery is a `rescan()`.
    #[error("cursor may be stale and needs a rescan")]
    CursorExpired,

    /// A pull response claimed `hasMore` without advancing past the
    /// cursor we handed it. Guards against a misbehaving provider
    /// spinning the client forever.
    #[error("pull did not advance the cursor while claiming more data exists")]
    InfiniteLoopDetected,

    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("payload (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Interrupted(#[from] interrupt_support::Interrupted),

    #[error("provider error: {0}")]
    Provider(String),
}

impl GetErrorHandling for Error {
    type ExternalError = Error;

    fn get_error_handling(&self) -> ErrorHandling<Self::ExternalError> {
        match self {
            Error::NonAtomicCapture | Error::Store(_) => {
                ErrorHandling::log(self.clone_for_reporting(), log::Level::Error)
            }
            Error::PushPermanentFailure(_) => {
                ErrorHandling::log(self.clone_for_reporting(), log::Level::Warn)
            }
            _ => ErrorHandling::passthrough(self.clone_for_reporting()),
        }
    }
}

// `rusqlite::Error` and `serde_json::Error` aren't `Clone`, so we can't
// derive it on `Error` itself; this gives `get_error_handling` something
// to hand back without consuming `self`.
impl Error {
    fn clone_for_reporting(&self) -> Error {
        match self {
            Error::NonAtomicCapture => Error::NonAtomicCapture,
            Error::PushPermanentFailure(s) => Error::PushPermanentFailure(s.clone()),
            Error::PushTransientFailure(s) => Error::PushTransientFailure(s.clone()),
            Error::SessionInvalid => Error::SessionInvalid,
            Error::CursorExpired => Error::CursorExpired,
            Error::InfiniteLoopDetected => Error::InfiniteLoopDetected,
            Error::Store(e) => Error::Provider(format!("store error: {e}")),
            Error::Json(e) => Error::Provider(format!("json error: {e}")),
            Error::Interrupted(_) => Error::Provider("interrupted".into()),
            Error::Provider(s) => Error::Provider(s.clone()),
        }
    }
}
