// src/transaction/results.rs

//! Accumulated results and terminal outcome of a transaction
//!
//! [`TransactionResults`] collects the data-bearing events a backend emits
//! (packages, details, repositories, error events, restart requirements, ...).
//! [`interpret_exit`] turns what the backend said and how its process ended
//! into an [`Outcome`].

use crate::backend::{BackendEvent, ExitOutcome, FinishedStatus, PackageInfo, RestartKind, Status};
use crate::role::PackageId;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

/// Error code reported when a backend dies without saying why
pub const INTERNAL_ERROR_CODE: &str = "internal-error";

/// Lines of stderr attached to a failure message
const STDERR_TAIL_LINES: usize = 10;

/// Why a transaction failed
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The backend broke the line protocol or its exit contract
    ProtocolViolation,
    /// The backend reported an error or died
    BackendFailure,
    /// The backend stopped producing output
    Timeout,
}

/// Failure details of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransactionError {
    pub kind: ErrorKind,
    /// Backend error code, kept verbatim
    pub code: Option<String>,
    pub message: String,
}

impl TransactionError {
    pub fn new(kind: ErrorKind, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }
}

/// Terminal outcome of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed(TransactionError),
    Cancelled,
}

impl Outcome {
    /// Shorthand for `Outcome::Failed`
    pub fn failed(kind: ErrorKind, code: Option<String>, message: impl Into<String>) -> Self {
        Outcome::Failed(TransactionError::new(kind, code, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn error(&self) -> Option<&TransactionError> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// State the transaction ends in
    pub fn finished_status(&self) -> FinishedStatus {
        match self {
            Outcome::Success => FinishedStatus::Success,
            Outcome::Failed(_) => FinishedStatus::Failed,
            Outcome::Cancelled => FinishedStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failed(err) => match err.code {
                Some(ref code) => write!(f, "failed [{}] {}", code, err),
                None => write!(f, "failed {}", err),
            },
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResult {
    pub info: PackageInfo,
    pub package_id: PackageId,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsResult {
    pub package_id: PackageId,
    pub license: String,
    pub group: String,
    pub description: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesResult {
    pub package_id: PackageId,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoResult {
    pub repo_id: String,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDetailResult {
    pub package_id: PackageId,
    pub updates: Vec<PackageId>,
    pub obsoletes: Vec<PackageId>,
    pub vendor_url: String,
    pub restart: RestartKind,
    pub update_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub parent_id: String,
    pub category_id: String,
    pub name: String,
    pub summary: String,
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroUpgradeResult {
    pub kind: String,
    pub name: String,
    pub summary: String,
}

/// An `error` event; non-terminal by itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub code: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartResult {
    pub kind: RestartKind,
    pub package_id: PackageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResult {
    pub kind: String,
    pub detail: String,
}

/// The backend needs a repository key to be trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub package_id: PackageId,
    pub repository: String,
    pub key_url: String,
    pub key_userid: String,
    pub key_id: String,
    pub key_fingerprint: String,
    pub key_timestamp: String,
    pub signature_type: String,
}

/// The backend needs a licence to be accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EulaRequest {
    pub eula_id: String,
    pub package_id: PackageId,
    pub vendor: String,
    pub license_agreement: String,
}

/// The backend needs other installation media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChangeRequest {
    pub media_type: String,
    pub media_id: String,
    pub media_text: String,
}

/// Everything a transaction produced, in arrival order per kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResults {
    pub packages: Vec<PackageResult>,
    pub details: Vec<DetailsResult>,
    pub files: Vec<FilesResult>,
    pub repos: Vec<RepoResult>,
    pub update_details: Vec<UpdateDetailResult>,
    pub categories: Vec<CategoryResult>,
    pub distro_upgrades: Vec<DistroUpgradeResult>,
    pub errors: Vec<ErrorResult>,
    pub require_restart: Vec<RestartResult>,
    pub messages: Vec<MessageResult>,
    pub signature_requests: Vec<SignatureRequest>,
    pub eula_requests: Vec<EulaRequest>,
    pub media_change_requests: Vec<MediaChangeRequest>,
}

impl TransactionResults {
    /// Store a data-bearing event
    ///
    /// Returns `false` for progress and control events, which are not kept.
    pub fn record(&mut self, event: &BackendEvent) -> bool {
        match event.clone() {
            BackendEvent::Package {
                info,
                package_id,
                summary,
            } => self.packages.push(PackageResult {
                info,
                package_id,
                summary,
            }),
            BackendEvent::Details {
                package_id,
                license,
                group,
                description,
                url,
                size,
            } => self.details.push(DetailsResult {
                package_id,
                license,
                group,
                description,
                url,
                size,
            }),
            BackendEvent::Files { package_id, files } => {
                self.files.push(FilesResult { package_id, files })
            }
            BackendEvent::RepoDetail {
                repo_id,
                description,
                enabled,
            } => self.repos.push(RepoResult {
                repo_id,
                description,
                enabled,
            }),
            BackendEvent::UpdateDetail {
                package_id,
                updates,
                obsoletes,
                vendor_url,
                restart,
                update_text,
            } => self.update_details.push(UpdateDetailResult {
                package_id,
                updates,
                obsoletes,
                vendor_url,
                restart,
                update_text,
            }),
            BackendEvent::Category {
                parent_id,
                category_id,
                name,
                summary,
                icon,
            } => self.categories.push(CategoryResult {
                parent_id,
                category_id,
                name,
                summary,
                icon,
            }),
            BackendEvent::DistroUpgrade {
                kind,
                name,
                summary,
            } => self.distro_upgrades.push(DistroUpgradeResult {
                kind,
                name,
                summary,
            }),
            BackendEvent::Error { code, detail } => self.errors.push(ErrorResult { code, detail }),
            BackendEvent::RequireRestart { kind, package_id } => {
                self.require_restart.push(RestartResult { kind, package_id })
            }
            BackendEvent::Message { kind, detail } => {
                self.messages.push(MessageResult { kind, detail })
            }
            BackendEvent::RepoSignatureRequired {
                package_id,
                repository,
                key_url,
                key_userid,
                key_id,
                key_fingerprint,
                key_timestamp,
                signature_type,
            } => self.signature_requests.push(SignatureRequest {
                package_id,
                repository,
                key_url,
                key_userid,
                key_id,
                key_fingerprint,
                key_timestamp,
                signature_type,
            }),
            BackendEvent::EulaRequired {
                eula_id,
                package_id,
                vendor,
                license_agreement,
            } => self.eula_requests.push(EulaRequest {
                eula_id,
                package_id,
                vendor,
                license_agreement,
            }),
            BackendEvent::MediaChangeRequired {
                media_type,
                media_id,
                media_text,
            } => self.media_change_requests.push(MediaChangeRequest {
                media_type,
                media_id,
                media_text,
            }),
            BackendEvent::Percentage(_)
            | BackendEvent::Subpercentage(_)
            | BackendEvent::Status(_)
            | BackendEvent::AllowCancel(_)
            | BackendEvent::Finished(_) => return false,
        }
        true
    }

    /// Most recent `error` event
    pub fn last_error(&self) -> Option<&ErrorResult> {
        self.errors.last()
    }
}

/// What the engine observed about a backend that exited on its own
#[derive(Debug, Clone, Copy)]
pub struct ExitReport<'a> {
    /// Status from the `finished` line, if there was one
    pub finished: Option<FinishedStatus>,
    pub exit: ExitOutcome,
    pub errors: &'a [ErrorResult],
    pub last_status: Status,
    pub stderr: &'a str,
}

fn stderr_tail(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

/// Decide the outcome of a backend that ran to exit
///
/// Engine-initiated endings (cancellation, inactivity timeout, too many bad
/// lines) never get here; the runner decides those directly.
///
/// | finished  | exit         | error events | outcome                     |
/// |-----------|--------------|--------------|-----------------------------|
/// | cancelled | any          | any          | Cancelled                   |
/// | failed    | any          | any          | BackendFailure              |
/// | any       | signal       | any          | BackendFailure              |
/// | any       | non-zero     | any          | BackendFailure              |
/// | none      | 0            | any          | ProtocolViolation           |
/// | success   | 0            | none         | Success                     |
/// | success   | 0            | some         | BackendFailure              |
pub fn interpret_exit(report: &ExitReport<'_>) -> Outcome {
    let last_error = report.errors.last();
    let error_code = last_error.map(|e| e.code.clone());
    let with_stderr = |mut message: String| {
        if let Some(tail) = stderr_tail(report.stderr) {
            message.push('\n');
            message.push_str(&tail);
        }
        message
    };

    if report.finished == Some(FinishedStatus::Cancelled) {
        return Outcome::Cancelled;
    }

    if report.finished == Some(FinishedStatus::Failed) {
        let message = match last_error {
            Some(e) => e.detail.clone(),
            None => "backend reported failure".to_string(),
        };
        return Outcome::failed(ErrorKind::BackendFailure, error_code, message);
    }

    match report.exit {
        ExitOutcome::Signaled(_) => {
            let message = format!(
                "backend {} (last status: {})",
                report.exit, report.last_status
            );
            return Outcome::failed(
                ErrorKind::BackendFailure,
                error_code.or_else(|| Some(INTERNAL_ERROR_CODE.to_string())),
                with_stderr(message),
            );
        }
        ExitOutcome::Exited(code) if code != 0 => {
            let message = match last_error {
                Some(e) => e.detail.clone(),
                None => format!(
                    "backend exited with code {} (last status: {})",
                    code, report.last_status
                ),
            };
            return Outcome::failed(
                ErrorKind::BackendFailure,
                error_code.or_else(|| Some(INTERNAL_ERROR_CODE.to_string())),
                with_stderr(message),
            );
        }
        ExitOutcome::Exited(_) => {}
    }

    match (report.finished, last_error) {
        (None, _) => Outcome::failed(
            ErrorKind::ProtocolViolation,
            error_code,
            "backend exited without sending 'finished'",
        ),
        (Some(_), Some(e)) => Outcome::failed(ErrorKind::BackendFailure, error_code, e.detail.clone()),
        (Some(_), None) => Outcome::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(finished: Option<FinishedStatus>, exit: ExitOutcome, errors: &[ErrorResult]) -> Outcome {
        interpret_exit(&ExitReport {
            finished,
            exit,
            errors,
            last_status: Status::Running,
            stderr: "",
        })
    }

    fn err(code: &str, detail: &str) -> ErrorResult {
        ErrorResult {
            code: code.to_string(),
            detail: detail.to_string(),
        }
    }

    #[test]
    fn test_finished_success_exit_zero() {
        assert_eq!(
            report(Some(FinishedStatus::Success), ExitOutcome::Exited(0), &[]),
            Outcome::Success
        );
    }

    #[test]
    fn test_finished_failed_keeps_backend_code() {
        let outcome = report(
            Some(FinishedStatus::Failed),
            ExitOutcome::Exited(0),
            &[err("package-not-found", "no such package foo")],
        );
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::BackendFailure);
        assert_eq!(error.code.as_deref(), Some("package-not-found"));
        assert_eq!(error.message, "no such package foo");
    }

    #[test]
    fn test_finished_cancelled() {
        assert_eq!(
            report(Some(FinishedStatus::Cancelled), ExitOutcome::Exited(1), &[]),
            Outcome::Cancelled
        );
    }

    #[test]
    fn test_missing_finished_exit_zero_is_protocol_violation() {
        let outcome = report(None, ExitOutcome::Exited(0), &[]);
        assert_eq!(outcome.error().unwrap().kind, ErrorKind::ProtocolViolation);

        // an error line alone does not end a transaction
        let outcome = report(None, ExitOutcome::Exited(0), &[err("no-network", "offline")]);
        assert_eq!(outcome.error().unwrap().kind, ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_nonzero_exit_is_internal_error() {
        let outcome = interpret_exit(&ExitReport {
            finished: None,
            exit: ExitOutcome::Exited(2),
            errors: &[],
            last_status: Status::Download,
            stderr: "Traceback\nKeyError: 'foo'\n",
        });
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::BackendFailure);
        assert_eq!(error.code.as_deref(), Some(INTERNAL_ERROR_CODE));
        assert!(error.message.contains("code 2"));
        assert!(error.message.contains("download"));
        assert!(error.message.contains("KeyError"));
    }

    #[test]
    fn test_signal_is_backend_failure() {
        let outcome = report(None, ExitOutcome::Signaled(9), &[]);
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::BackendFailure);
        assert!(error.message.contains("SIGKILL"));
    }

    #[test]
    fn test_error_event_then_success_is_failure() {
        let outcome = report(
            Some(FinishedStatus::Success),
            ExitOutcome::Exited(0),
            &[err("gpg-failure", "bad signature")],
        );
        assert_eq!(outcome.error().unwrap().kind, ErrorKind::BackendFailure);
    }

    #[test]
    fn test_record_results() {
        let mut results = TransactionResults::default();
        let id = PackageId::parse("foo;1.0;x86_64;repo").unwrap();
        assert!(results.record(&BackendEvent::Package {
            info: PackageInfo::Installed,
            package_id: id.clone(),
            summary: "Foo".to_string(),
        }));
        assert!(results.record(&BackendEvent::Error {
            code: "no-network".to_string(),
            detail: "offline".to_string(),
        }));
        assert!(!results.record(&BackendEvent::Percentage(Some(10))));
        assert!(!results.record(&BackendEvent::Finished(FinishedStatus::Success)));

        assert_eq!(results.packages.len(), 1);
        assert_eq!(results.packages[0].package_id, id);
        assert_eq!(results.last_error().unwrap().code, "no-network");
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = Outcome::failed(ErrorKind::Timeout, None, "no output for 5s");
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"failed\""));
        assert!(json.contains("\"kind\":\"timeout\""));
        assert_eq!(serde_json::to_string(&Outcome::Success).unwrap(), r#"{"outcome":"success"}"#);
    }
}
