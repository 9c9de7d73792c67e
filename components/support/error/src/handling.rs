//! Helpers for components to "handle" errors: decide how an internal error
//! gets logged and what gets handed back to the caller.

/// Describes what logging action should be taken for an internal error.
#[derive(Debug, Default)]
pub struct ErrorReporting {
    /// If `Some(level)`, a log message is written at that level.
    log_level: Option<log::Level>,
}

/// Specifies how an "internal" error is converted to an "external" public
/// error, plus any logging that should happen along the way.
pub struct ErrorHandling<E> {
    pub err: E,
    pub reporting: ErrorReporting,
}

impl<E> ErrorHandling<E> {
    /// Convert without any special logging.
    pub fn passthrough(err: E) -> Self {
        Self {
            err,
            reporting: ErrorReporting::default(),
        }
    }

    /// Convert and log at the given level.
    pub fn log(err: E, level: log::Level) -> Self {
        Self {
            err,
            reporting: ErrorReporting {
                log_level: Some(level),
            },
        }
    }

    /// Convert and log as an unexpected (ERROR level) condition.
    pub fn unexpected(err: E) -> Self {
        Self::log(err, log::Level::Error)
    }
}

/// A trait to define how errors are converted and reported.
pub trait GetErrorHandling {
    type ExternalError;

    fn get_error_handling(&self) -> ErrorHandling<Self::ExternalError>;
}

/// Handle the specified "internal" error: take any logging action and
/// convert the error to the public error.
pub fn convert_log_report_error<IE, EE>(e: IE) -> EE
where
    IE: GetErrorHandling<ExternalError = EE> + std::error::Error,
    EE: std::error::Error,
{
    let handling = e.get_error_handling();
    if let Some(level) = handling.reporting.log_level {
        log::log!(level, "{}", e);
    }
    handling.err
}
