//! Human-readable run summary and process exit policy.

use std::fmt;
use std::process::ExitCode;

use crate::model::PublishResult;

/// Exit status of a run that failed.
pub const EXIT_FAILED: u8 = 1;
/// Exit status of a successful run with missing files, when strict.
pub const EXIT_PARTIAL: u8 = 2;

/// Map a result to an exit status.
///
/// With `fail_on_partial` set, a run that succeeded but left any file out of
/// the published tree exits with [`EXIT_PARTIAL`].
pub fn exit_status(result: &PublishResult, fail_on_partial: bool) -> u8 {
    if !result.success {
        EXIT_FAILED
    } else if fail_on_partial && result.files_skipped + result.files_failed > 0 {
        EXIT_PARTIAL
    } else {
        0
    }
}

pub fn exit_code(result: &PublishResult, fail_on_partial: bool) -> ExitCode {
    ExitCode::from(exit_status(result, fail_on_partial))
}

/// End-of-run summary, rendered through [`fmt::Display`].
pub struct Summary<'a> {
    result: &'a PublishResult,
    dry_run: bool,
}

impl<'a> Summary<'a> {
    pub fn new(result: &'a PublishResult, dry_run: bool) -> Self {
        Self { result, dry_run }
    }
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = self.result;
        let headline = match (result.success, self.dry_run) {
            (true, true) => "Dry run complete",
            (true, false) => "Repository published",
            (false, _) => "Publish failed",
        };
        writeln!(f, "{headline}")?;
        writeln!(
            f,
            "  files: {} of {} uploaded, {} skipped, {} failed",
            result.files_uploaded,
            result.files_total(),
            result.files_skipped,
            result.files_failed
        )?;
        if let Some(url) = &result.repo_url {
            writeln!(f, "  repository: {url}")?;
        }
        if let Some(sha) = &result.commit_sha {
            writeln!(f, "  commit: {sha}")?;
        }
        if let Some(error) = &result.error {
            match result.failed_in {
                Some(state) => writeln!(f, "  error ({state}): {error}")?,
                None => writeln!(f, "  error: {error}")?,
            }
        }
        if !result.failures.is_empty() {
            writeln!(f, "  files not published:")?;
            for failure in &result.failures {
                writeln!(f, "    {}: {}", failure.path, failure.reason)?;
            }
        }
        Ok(())
    }
}
