//! Best-effort compensation.
//!
//! Teardown paths run every step even when an earlier one fails, then report
//! what went wrong. [`join_errors`] turns the collected outcomes into a single
//! result without rewording any of them.

use portcullis_common::{PortcullisError, PortcullisResult};

/// Fold the outcomes of independent steps into one result.
///
/// No failures gives `Ok`, a single failure is returned unchanged, several
/// become [`PortcullisError::Combined`] in the order they were given.
///
/// # Errors
///
/// Returns the failure(s) found in `results`.
pub fn join_errors<I>(results: I) -> PortcullisResult<()>
where
    I: IntoIterator<Item = PortcullisResult<()>>,
{
    let mut errors: Vec<PortcullisError> = results.into_iter().filter_map(Result::err).collect();

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(PortcullisError::Combined(errors)),
    }
}
