// src/backend/codec.rs

//! Line protocol spoken between the daemon and backend processes
//!
//! Backends write one event per line to stdout, fields separated by a TAB:
//!
//! ```text
//! status	dep-resolve
//! percentage	40
//! package	removing	foo;1.0;x86_64;fedora	The foo library
//! finished	success
//! ```
//!
//! The daemon in turn starts a backend with the role name and the role's
//! parameters as positional argv entries (see [`arguments`]). Lists are
//! packed into a single entry joined by [`LIST_DELIMITER`], booleans are
//! `true`/`false` and an empty filter or flag set is `none`.
//!
//! Decoding problems are reported per line and are never fatal on their own.

use crate::role::{
    FilterSet, LIST_DELIMITER, PackageId, Params, RESERVED_CHARS, Role, TransactionFlags,
    UpgradeKind,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use strum_macros::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

/// Field separator of the stdout protocol
pub const FIELD_DELIMITER: char = '\t';

/// Separator between file names inside a `files` event
const FILE_LIST_DELIMITER: char = ';';

/// Percentage value a backend sends when progress cannot be estimated
pub const PERCENTAGE_UNKNOWN: u8 = 101;

/// Errors produced while decoding backend output or argv
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The first field is not a known command keyword
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// A known keyword with the wrong number or shape of fields
    #[error("malformed '{command}' event: {reason}")]
    MalformedEvent { command: String, reason: String },

    /// Positional arguments do not match the role's contract
    #[error("malformed arguments for '{role}': {reason}")]
    MalformedArguments { role: String, reason: String },
}

/// What the backend is currently doing
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Unknown,
    Wait,
    Setup,
    Running,
    Query,
    Info,
    Remove,
    RefreshCache,
    Download,
    Install,
    Update,
    Cleanup,
    Obsolete,
    DepResolve,
    SigCheck,
    TestCommit,
    Commit,
    Request,
    Finished,
    Cancel,
    DownloadRepository,
    DownloadPackagelist,
    DownloadFilelist,
    DownloadChangelog,
    DownloadGroup,
    DownloadUpdateinfo,
    Repackaging,
    LoadingCache,
    ScanApplications,
    GeneratePackageList,
    WaitingForLock,
    WaitingForAuth,
    ScanProcessList,
    CheckExecutableFiles,
    CheckLibraries,
    CopyFiles,
    RunHook,
}

/// Per-package information attached to a `package` event
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PackageInfo {
    Unknown,
    Installed,
    Available,
    Low,
    Enhancement,
    Normal,
    Bugfix,
    Important,
    Security,
    Blocked,
    Downloading,
    Updating,
    Installing,
    Removing,
    Cleanup,
    Obsoleting,
    CollectionInstalled,
    CollectionAvailable,
    Finished,
    Reinstalling,
    Downgrading,
    Preparing,
    Decompressing,
    Untrusted,
    Trusted,
    Unavailable,
}

/// What has to be restarted after a package change
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RestartKind {
    None,
    Application,
    Session,
    System,
    SecuritySession,
    SecuritySystem,
}

/// Outcome a backend declares in its `finished` line
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FinishedStatus {
    Success,
    Failed,
    Cancelled,
}

/// One decoded line of backend output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BackendEvent {
    Package {
        info: PackageInfo,
        package_id: PackageId,
        summary: String,
    },
    Details {
        package_id: PackageId,
        license: String,
        group: String,
        description: String,
        url: String,
        size: u64,
    },
    Files {
        package_id: PackageId,
        files: Vec<String>,
    },
    RepoDetail {
        repo_id: String,
        description: String,
        enabled: bool,
    },
    UpdateDetail {
        package_id: PackageId,
        updates: Vec<PackageId>,
        obsoletes: Vec<PackageId>,
        vendor_url: String,
        restart: RestartKind,
        update_text: String,
    },
    Category {
        parent_id: String,
        category_id: String,
        name: String,
        summary: String,
        icon: String,
    },
    DistroUpgrade {
        kind: String,
        name: String,
        summary: String,
    },
    /// `None` when the backend cannot estimate progress
    Percentage(Option<u8>),
    Subpercentage(u8),
    Status(Status),
    /// Backend-defined error code and detail, kept verbatim
    Error {
        code: String,
        detail: String,
    },
    RequireRestart {
        kind: RestartKind,
        package_id: PackageId,
    },
    AllowCancel(bool),
    Message {
        kind: String,
        detail: String,
    },
    RepoSignatureRequired {
        package_id: PackageId,
        repository: String,
        key_url: String,
        key_userid: String,
        key_id: String,
        key_fingerprint: String,
        key_timestamp: String,
        signature_type: String,
    },
    EulaRequired {
        eula_id: String,
        package_id: PackageId,
        vendor: String,
        license_agreement: String,
    },
    MediaChangeRequired {
        media_type: String,
        media_id: String,
        media_text: String,
    },
    Finished(FinishedStatus),
}

impl BackendEvent {
    /// Protocol keyword of this event
    pub fn keyword(&self) -> &'static str {
        match self {
            BackendEvent::Package { .. } => "package",
            BackendEvent::Details { .. } => "details",
            BackendEvent::Files { .. } => "files",
            BackendEvent::RepoDetail { .. } => "repo-detail",
            BackendEvent::UpdateDetail { .. } => "updatedetail",
            BackendEvent::Category { .. } => "category",
            BackendEvent::DistroUpgrade { .. } => "distro-upgrade",
            BackendEvent::Percentage(_) => "percentage",
            BackendEvent::Subpercentage(_) => "subpercentage",
            BackendEvent::Status(_) => "status",
            BackendEvent::Error { .. } => "error",
            BackendEvent::RequireRestart { .. } => "requirerestart",
            BackendEvent::AllowCancel(_) => "allow-cancel",
            BackendEvent::Message { .. } => "message",
            BackendEvent::RepoSignatureRequired { .. } => "repo-signature-required",
            BackendEvent::EulaRequired { .. } => "eula-required",
            BackendEvent::MediaChangeRequired { .. } => "media-change-required",
            BackendEvent::Finished(_) => "finished",
        }
    }
}

/// Cursor over the fields of one line
struct Fields<'a> {
    command: &'a str,
    parts: std::str::Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn malformed(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::MalformedEvent {
            command: self.command.to_string(),
            reason: reason.into(),
        }
    }

    fn text(&mut self, name: &str) -> Result<&'a str, DecodeError> {
        self.parts
            .next()
            .ok_or_else(|| self.malformed(format!("missing field '{}'", name)))
    }

    /// Last free-text field; stray delimiters inside it are kept
    fn rest(&mut self, name: &str) -> Result<String, DecodeError> {
        let first = self.text(name)?;
        let remainder: Vec<&str> = self.parts.by_ref().collect();
        if remainder.is_empty() {
            Ok(first.to_string())
        } else {
            Ok(format!("{}{}{}", first, FIELD_DELIMITER, remainder.join("\t")))
        }
    }

    fn parse<T: FromStr>(&mut self, name: &str) -> Result<T, DecodeError> {
        let raw = self.text(name)?;
        raw.parse()
            .map_err(|_| self.malformed(format!("invalid {} '{}'", name, raw)))
    }

    fn package_id(&mut self) -> Result<PackageId, DecodeError> {
        let raw = self.text("package id")?;
        PackageId::parse(raw).map_err(|e| self.malformed(e))
    }

    fn package_ids(&mut self, name: &str) -> Result<Vec<PackageId>, DecodeError> {
        let raw = self.text(name)?;
        split_list(raw)
            .map(|id| PackageId::parse(id).map_err(|e| self.malformed(e)))
            .collect()
    }

    fn boolean(&mut self, name: &str) -> Result<bool, DecodeError> {
        let raw = self.text(name)?;
        parse_bool(raw).ok_or_else(|| self.malformed(format!("invalid {} '{}'", name, raw)))
    }

    fn finish(mut self) -> Result<(), DecodeError> {
        match self.parts.next() {
            None => Ok(()),
            Some(extra) => Err(self.malformed(format!("unexpected field '{}'", extra))),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" | "TRUE" | "yes" => Some(true),
        "false" | "FALSE" | "no" => Some(false),
        _ => None,
    }
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn join_ids(ids: &[PackageId]) -> String {
    ids.iter()
        .map(PackageId::as_str)
        .collect::<Vec<_>>()
        .join("&")
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(LIST_DELIMITER).filter(|s| !s.is_empty())
}

/// Decode one line of backend stdout
///
/// Trailing `\r`/`\n` are ignored. Blank lines decode as an unknown empty
/// command so that callers treat them like any other noise.
pub fn decode_line(raw_line: &str) -> Result<BackendEvent, DecodeError> {
    let line = raw_line.trim_end_matches(['\n', '\r']);
    let mut parts = line.split(FIELD_DELIMITER);
    let command = parts.next().unwrap_or_default();
    let mut f = Fields { command, parts };

    let event = match command {
        "package" => BackendEvent::Package {
            info: f.parse("info")?,
            package_id: f.package_id()?,
            summary: f.rest("summary")?,
        },
        "details" => BackendEvent::Details {
            package_id: f.package_id()?,
            license: f.text("license")?.to_string(),
            group: f.text("group")?.to_string(),
            description: f.text("description")?.to_string(),
            url: f.text("url")?.to_string(),
            size: f.parse("size")?,
        },
        "files" => BackendEvent::Files {
            package_id: f.package_id()?,
            files: f
                .text("files")?
                .split(FILE_LIST_DELIMITER)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        },
        "repo-detail" => BackendEvent::RepoDetail {
            repo_id: f.text("repo id")?.to_string(),
            description: f.text("description")?.to_string(),
            enabled: f.boolean("enabled")?,
        },
        "updatedetail" => BackendEvent::UpdateDetail {
            package_id: f.package_id()?,
            updates: f.package_ids("updates")?,
            obsoletes: f.package_ids("obsoletes")?,
            vendor_url: f.text("vendor url")?.to_string(),
            restart: f.parse("restart")?,
            update_text: f.rest("update text")?,
        },
        "category" => BackendEvent::Category {
            parent_id: f.text("parent id")?.to_string(),
            category_id: f.text("category id")?.to_string(),
            name: f.text("name")?.to_string(),
            summary: f.text("summary")?.to_string(),
            icon: f.text("icon")?.to_string(),
        },
        "distro-upgrade" => BackendEvent::DistroUpgrade {
            kind: f.text("kind")?.to_string(),
            name: f.text("name")?.to_string(),
            summary: f.rest("summary")?,
        },
        "percentage" => {
            let value: u8 = f.parse("percentage")?;
            match value {
                0..=100 => BackendEvent::Percentage(Some(value)),
                PERCENTAGE_UNKNOWN => BackendEvent::Percentage(None),
                _ => return Err(f.malformed(format!("percentage {} out of range", value))),
            }
        }
        "subpercentage" => {
            let value: u8 = f.parse("subpercentage")?;
            if value > 100 {
                return Err(f.malformed(format!("subpercentage {} out of range", value)));
            }
            BackendEvent::Subpercentage(value)
        }
        "status" => BackendEvent::Status(f.parse("status")?),
        "error" => BackendEvent::Error {
            code: f.text("code")?.to_string(),
            detail: f.rest("detail").unwrap_or_default(),
        },
        "requirerestart" => BackendEvent::RequireRestart {
            kind: f.parse("restart kind")?,
            package_id: f.package_id()?,
        },
        "allow-cancel" => BackendEvent::AllowCancel(f.boolean("allow-cancel")?),
        "message" => BackendEvent::Message {
            kind: f.text("kind")?.to_string(),
            detail: f.rest("detail").unwrap_or_default(),
        },
        "repo-signature-required" => BackendEvent::RepoSignatureRequired {
            package_id: f.package_id()?,
            repository: f.text("repository")?.to_string(),
            key_url: f.text("key url")?.to_string(),
            key_userid: f.text("key userid")?.to_string(),
            key_id: f.text("key id")?.to_string(),
            key_fingerprint: f.text("key fingerprint")?.to_string(),
            key_timestamp: f.text("key timestamp")?.to_string(),
            signature_type: f.text("signature type")?.to_string(),
        },
        "eula-required" => BackendEvent::EulaRequired {
            eula_id: f.text("eula id")?.to_string(),
            package_id: f.package_id()?,
            vendor: f.text("vendor")?.to_string(),
            license_agreement: f.rest("license agreement")?,
        },
        "media-change-required" => BackendEvent::MediaChangeRequired {
            media_type: f.text("media type")?.to_string(),
            media_id: f.text("media id")?.to_string(),
            media_text: f.rest("media text")?,
        },
        // Older helpers emit a bare `finished`
        "finished" => match f.parts.next() {
            None | Some("") => BackendEvent::Finished(FinishedStatus::Success),
            Some(raw) => BackendEvent::Finished(
                raw.parse()
                    .map_err(|_| f.malformed(format!("invalid exit '{}'", raw)))?,
            ),
        },
        other => return Err(DecodeError::UnknownCommand(other.to_string())),
    };

    f.finish()?;
    Ok(event)
}

/// Encode an event as one protocol line (without the trailing newline)
pub fn encode_event(event: &BackendEvent) -> String {
    let fields: Vec<String> = match event {
        BackendEvent::Package {
            info,
            package_id,
            summary,
        } => vec![info.to_string(), package_id.to_string(), summary.clone()],
        BackendEvent::Details {
            package_id,
            license,
            group,
            description,
            url,
            size,
        } => vec![
            package_id.to_string(),
            license.clone(),
            group.clone(),
            description.clone(),
            url.clone(),
            size.to_string(),
        ],
        BackendEvent::Files { package_id, files } => {
            vec![package_id.to_string(), files.join(";")]
        }
        BackendEvent::RepoDetail {
            repo_id,
            description,
            enabled,
        } => vec![
            repo_id.clone(),
            description.clone(),
            bool_str(*enabled).to_string(),
        ],
        BackendEvent::UpdateDetail {
            package_id,
            updates,
            obsoletes,
            vendor_url,
            restart,
            update_text,
        } => vec![
            package_id.to_string(),
            join_ids(updates),
            join_ids(obsoletes),
            vendor_url.clone(),
            restart.to_string(),
            update_text.clone(),
        ],
        BackendEvent::Category {
            parent_id,
            category_id,
            name,
            summary,
            icon,
        } => vec![
            parent_id.clone(),
            category_id.clone(),
            name.clone(),
            summary.clone(),
            icon.clone(),
        ],
        BackendEvent::DistroUpgrade {
            kind,
            name,
            summary,
        } => vec![kind.clone(), name.clone(), summary.clone()],
        BackendEvent::Percentage(value) => {
            vec![value.unwrap_or(PERCENTAGE_UNKNOWN).to_string()]
        }
        BackendEvent::Subpercentage(value) => vec![value.to_string()],
        BackendEvent::Status(status) => vec![status.to_string()],
        BackendEvent::Error { code, detail } => vec![code.clone(), detail.clone()],
        BackendEvent::RequireRestart { kind, package_id } => {
            vec![kind.to_string(), package_id.to_string()]
        }
        BackendEvent::AllowCancel(allowed) => vec![bool_str(*allowed).to_string()],
        BackendEvent::Message { kind, detail } => vec![kind.clone(), detail.clone()],
        BackendEvent::RepoSignatureRequired {
            package_id,
            repository,
            key_url,
            key_userid,
            key_id,
            key_fingerprint,
            key_timestamp,
            signature_type,
        } => vec![
            package_id.to_string(),
            repository.clone(),
            key_url.clone(),
            key_userid.clone(),
            key_id.clone(),
            key_fingerprint.clone(),
            key_timestamp.clone(),
            signature_type.clone(),
        ],
        BackendEvent::EulaRequired {
            eula_id,
            package_id,
            vendor,
            license_agreement,
        } => vec![
            eula_id.clone(),
            package_id.to_string(),
            vendor.clone(),
            license_agreement.clone(),
        ],
        BackendEvent::MediaChangeRequired {
            media_type,
            media_id,
            media_text,
        } => vec![media_type.clone(), media_id.clone(), media_text.clone()],
        BackendEvent::Finished(status) => vec![status.to_string()],
    };

    let mut line = event.keyword().to_string();
    for field in fields {
        line.push(FIELD_DELIMITER);
        line.push_str(&field);
    }
    line
}

/// One positional argument slot of a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Filters,
    Flags,
    PackageIds,
    Values,
    Files,
    Recursive,
    AllowDeps,
    Autoremove,
    Force,
    RepoId,
    Enabled,
    Directory,
    DistroId,
    UpgradeKind,
}

/// Positional argument contract of a role
///
/// The order is part of the backend protocol and must never change for an
/// existing role.
pub fn arguments(role: Role) -> &'static [Arg] {
    use Arg::*;
    match role {
        Role::SearchName
        | Role::SearchDetails
        | Role::SearchGroup
        | Role::SearchFile
        | Role::Resolve
        | Role::WhatProvides => &[Filters, Values],
        Role::GetDetails | Role::GetFiles | Role::GetUpdateDetail => &[PackageIds],
        Role::GetDetailsLocal | Role::GetFilesLocal => &[Files],
        Role::DependsOn | Role::RequiredBy => &[Filters, PackageIds, Recursive],
        Role::GetPackages | Role::GetUpdates | Role::GetRepoList => &[Filters],
        Role::InstallPackages | Role::UpdatePackages => &[Flags, PackageIds],
        Role::InstallFiles => &[Flags, Files],
        Role::RemovePackages => &[Flags, PackageIds, AllowDeps, Autoremove],
        Role::DownloadPackages => &[Directory, PackageIds],
        Role::RefreshCache => &[Force],
        Role::RepoEnable => &[RepoId, Enabled],
        Role::RepoRemove => &[Flags, RepoId, Autoremove],
        Role::GetCategories | Role::GetDistroUpgrades => &[],
        Role::UpgradeSystem => &[Flags, DistroId, UpgradeKind],
        Role::RepairSystem => &[Flags],
    }
}

fn check_value(value: &str, what: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("empty {}", what));
    }
    if value.contains(RESERVED_CHARS) {
        return Err(format!("{} '{}' contains a reserved character", what, value.escape_debug()));
    }
    Ok(())
}

/// Check that `params` fit the argument contract of `role`
///
/// Every slot the role takes must be filled, and list or optional fields the
/// role does not take must be left empty.
pub fn check_params(role: Role, params: &Params) -> Result<(), String> {
    let args = arguments(role);
    let takes = |arg: Arg| args.contains(&arg);

    if takes(Arg::PackageIds) {
        if params.package_ids.is_empty() {
            return Err("at least one package id is required".to_string());
        }
    } else if !params.package_ids.is_empty() {
        return Err("role does not take package ids".to_string());
    }

    if takes(Arg::Values) || takes(Arg::Files) {
        if params.values.is_empty() {
            return Err("at least one value is required".to_string());
        }
        for value in &params.values {
            check_value(value, "value")?;
        }
    } else if !params.values.is_empty() {
        return Err("role does not take values".to_string());
    }

    if !takes(Arg::Filters) && !params.filters.is_empty() {
        return Err("role does not take filters".to_string());
    }
    if !takes(Arg::Flags) && !params.flags.is_empty() {
        return Err("role does not take transaction flags".to_string());
    }

    match (&params.repo_id, takes(Arg::RepoId)) {
        (Some(repo), true) => check_value(repo, "repository id")?,
        (None, true) => return Err("a repository id is required".to_string()),
        (Some(_), false) => return Err("role does not take a repository id".to_string()),
        (None, false) => {}
    }

    match (params.enabled, takes(Arg::Enabled)) {
        (None, true) => return Err("the enabled state is required".to_string()),
        (Some(_), false) => return Err("role does not take an enabled state".to_string()),
        _ => {}
    }

    match (&params.directory, takes(Arg::Directory)) {
        (Some(dir), true) => check_value(&dir.to_string_lossy(), "directory")?,
        (None, true) => return Err("a destination directory is required".to_string()),
        (Some(_), false) => return Err("role does not take a directory".to_string()),
        (None, false) => {}
    }

    match (&params.distro_id, takes(Arg::DistroId)) {
        (Some(distro), true) => check_value(distro, "distribution id")?,
        (None, true) => return Err("a distribution id is required".to_string()),
        (Some(_), false) => return Err("role does not take a distribution id".to_string()),
        (None, false) => {}
    }

    Ok(())
}

/// Encode the argv for a role: the role name followed by its arguments
///
/// `params` are expected to have passed [`check_params`].
pub fn encode_command(role: Role, params: &Params) -> Vec<String> {
    let mut argv = Vec::with_capacity(arguments(role).len() + 1);
    argv.push(role.to_string());

    for arg in arguments(role) {
        let token = match arg {
            Arg::Filters => params.filters.to_string(),
            Arg::Flags => params.flags.to_string(),
            Arg::PackageIds => join_ids(&params.package_ids),
            Arg::Values | Arg::Files => params.values.join("&"),
            Arg::Recursive => bool_str(params.recursive).to_string(),
            Arg::AllowDeps => bool_str(params.allow_deps).to_string(),
            Arg::Autoremove => bool_str(params.autoremove).to_string(),
            Arg::Force => bool_str(params.force).to_string(),
            Arg::RepoId => params.repo_id.clone().unwrap_or_default(),
            Arg::Enabled => bool_str(params.enabled.unwrap_or(false)).to_string(),
            Arg::Directory => params
                .directory
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Arg::DistroId => params.distro_id.clone().unwrap_or_default(),
            Arg::UpgradeKind => params.upgrade_kind.to_string(),
        };
        argv.push(token);
    }

    argv
}

/// Decode an argv produced by [`encode_command`]
///
/// Used by backends written against this crate. Only the fields that travel
/// on the command line are reconstructed.
pub fn decode_command<S: AsRef<str>>(argv: &[S]) -> Result<(Role, Params), DecodeError> {
    let (name, rest) = argv
        .split_first()
        .ok_or_else(|| DecodeError::UnknownCommand(String::new()))?;
    let name = name.as_ref();
    let role: Role = name
        .parse()
        .map_err(|_| DecodeError::UnknownCommand(name.to_string()))?;

    let malformed = |reason: String| DecodeError::MalformedArguments {
        role: name.to_string(),
        reason,
    };

    let args = arguments(role);
    if rest.len() != args.len() {
        return Err(malformed(format!(
            "expected {} arguments, got {}",
            args.len(),
            rest.len()
        )));
    }

    let boolean = |raw: &str| parse_bool(raw).ok_or_else(|| malformed(format!("invalid boolean '{}'", raw)));

    let mut params = Params::default();
    for (arg, raw) in args.iter().zip(rest) {
        let raw = raw.as_ref();
        match arg {
            Arg::Filters => params.filters = FilterSet::from_str(raw).map_err(malformed)?,
            Arg::Flags => params.flags = TransactionFlags::from_str(raw).map_err(malformed)?,
            Arg::PackageIds => {
                params.package_ids = split_list(raw)
                    .map(PackageId::parse)
                    .collect::<Result<_, _>>()
                    .map_err(malformed)?;
            }
            Arg::Values | Arg::Files => {
                params.values = split_list(raw).map(str::to_string).collect();
            }
            Arg::Recursive => params.recursive = boolean(raw)?,
            Arg::AllowDeps => params.allow_deps = boolean(raw)?,
            Arg::Autoremove => params.autoremove = boolean(raw)?,
            Arg::Force => params.force = boolean(raw)?,
            Arg::RepoId => params.repo_id = Some(raw.to_string()),
            Arg::Enabled => params.enabled = Some(boolean(raw)?),
            Arg::Directory => params.directory = Some(PathBuf::from(raw)),
            Arg::DistroId => params.distro_id = Some(raw.to_string()),
            Arg::UpgradeKind => {
                params.upgrade_kind = UpgradeKind::from_str(raw)
                    .map_err(|_| malformed(format!("invalid upgrade kind '{}'", raw)))?;
            }
        }
    }

    Ok((role, params))
}
