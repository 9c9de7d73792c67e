//! Shared helpers for converting and logging internal errors the way the
//! sync engine's components do it: an internal error type stays rich
//! (`thiserror`-derived, carries the failing context) while this crate
//! supplies a uniform way to log it and classify it for the caller.

mod handling;

pub use handling::{ErrorHandling, ErrorReporting, GetErrorHandling};

/// Log `e` and convert it via its `GetErrorHandling` impl.
///
/// Most modules wrap their fallible operations in this instead of a bare
/// `?`, so that the decision "is this worth a WARN, should it bubble up
/// as-is" lives next to the error definition rather than at every call
/// site.
pub fn convert_log_report_error<IE, EE>(e: IE) -> EE
where
    IE: GetErrorHandling<ExternalError = EE> + std::error::Error,
    EE: std::error::Error,
{
    handling::convert_log_report_error(e)
}

#[macro_export]
macro_rules! handle_error {
    ($e:expr) => {
        $crate::convert_log_report_error($e)
    };
}
