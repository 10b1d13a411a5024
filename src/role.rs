// src/role.rs

//! Request vocabulary shared by the queue, transactions and backends
//!
//! - [`Role`]: the kind of operation a transaction performs
//! - [`FilterSet`] / [`TransactionFlags`]: opaque predicate sets passed
//!   through to the backend untouched
//! - [`PackageId`]: the `name;version;arch;origin` identifier
//! - [`Params`]: everything a client supplies alongside a role
//!
//! The engine never interprets filter or flag semantics. It only checks that
//! a backend declared what it is asked to honour, and transports the rest.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// Separator between entries of a list packed into a single argv token
pub const LIST_DELIMITER: char = '&';

/// Characters a user-supplied value may never contain
pub const RESERVED_CHARS: [char; 4] = [LIST_DELIMITER, '\t', '\n', '\r'];

/// Kind of package operation
///
/// The string form is the name passed to the backend as the first argv entry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    GetCategories,
    DependsOn,
    GetDetails,
    GetDetailsLocal,
    GetFiles,
    GetFilesLocal,
    GetPackages,
    GetRepoList,
    RequiredBy,
    GetUpdateDetail,
    GetUpdates,
    InstallFiles,
    InstallPackages,
    RefreshCache,
    RemovePackages,
    RepoEnable,
    RepoRemove,
    Resolve,
    SearchDetails,
    SearchFile,
    SearchGroup,
    SearchName,
    UpdatePackages,
    WhatProvides,
    DownloadPackages,
    GetDistroUpgrades,
    UpgradeSystem,
    RepairSystem,
}

impl Role {
    /// Whether the role changes system state (as opposed to querying it)
    pub fn is_modifying(self) -> bool {
        matches!(
            self,
            Role::InstallFiles
                | Role::InstallPackages
                | Role::RemovePackages
                | Role::UpdatePackages
                | Role::RefreshCache
                | Role::RepoEnable
                | Role::RepoRemove
                | Role::UpgradeSystem
                | Role::RepairSystem
        )
    }

    /// Wire name of the role
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Predicate a query can be constrained by
///
/// Each predicate has a negated `~` twin. Values are bit positions in a
/// [`FilterSet`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
pub enum Filter {
    #[strum(serialize = "installed")]
    Installed,
    #[strum(serialize = "~installed")]
    NotInstalled,
    #[strum(serialize = "devel")]
    Devel,
    #[strum(serialize = "~devel")]
    NotDevel,
    #[strum(serialize = "gui")]
    Gui,
    #[strum(serialize = "~gui")]
    NotGui,
    #[strum(serialize = "free")]
    Free,
    #[strum(serialize = "~free")]
    NotFree,
    #[strum(serialize = "visible")]
    Visible,
    #[strum(serialize = "~visible")]
    NotVisible,
    #[strum(serialize = "supported")]
    Supported,
    #[strum(serialize = "~supported")]
    NotSupported,
    #[strum(serialize = "basename")]
    Basename,
    #[strum(serialize = "~basename")]
    NotBasename,
    #[strum(serialize = "newest")]
    Newest,
    #[strum(serialize = "~newest")]
    NotNewest,
    #[strum(serialize = "arch")]
    Arch,
    #[strum(serialize = "~arch")]
    NotArch,
    #[strum(serialize = "source")]
    Source,
    #[strum(serialize = "~source")]
    NotSource,
    #[strum(serialize = "collections")]
    Collections,
    #[strum(serialize = "~collections")]
    NotCollections,
    #[strum(serialize = "application")]
    Application,
    #[strum(serialize = "~application")]
    NotApplication,
    #[strum(serialize = "downloaded")]
    Downloaded,
    #[strum(serialize = "~downloaded")]
    NotDownloaded,
}

/// Modifier for modifying transactions
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum TransactionFlag {
    OnlyTrusted,
    Simulate,
    OnlyDownload,
    AllowReinstall,
    JustReinstall,
    AllowDowngrade,
}

/// An enum that can be stored in a [`Bitfield`]
pub trait BitFlag:
    Copy + PartialEq + IntoEnumIterator + fmt::Display + FromStr + Into<&'static str>
{
}

impl BitFlag for Filter {}
impl BitFlag for TransactionFlag {}

/// Set of flags packed into a `u64`
///
/// Rendered as `none` when empty and as `;`-joined names otherwise, which is
/// also the form backends receive on their command line.
pub struct Bitfield<T> {
    bits: u64,
    _marker: PhantomData<T>,
}

/// Query filters requested by a client
pub type FilterSet = Bitfield<Filter>;

/// Flags of a modifying transaction
pub type TransactionFlags = Bitfield<TransactionFlag>;

impl<T: BitFlag> Bitfield<T> {
    /// Empty set
    pub const fn empty() -> Self {
        Self {
            bits: 0,
            _marker: PhantomData,
        }
    }

    fn bit(flag: T) -> u64 {
        let index = T::iter().position(|f| f == flag).unwrap_or(0);
        1 << index
    }

    /// Add a flag
    pub fn insert(&mut self, flag: T) {
        self.bits |= Self::bit(flag);
    }

    /// Builder-style insert
    pub fn with(mut self, flag: T) -> Self {
        self.insert(flag);
        self
    }

    /// Whether the flag is set
    pub fn contains(&self, flag: T) -> bool {
        self.bits & Self::bit(flag) != 0
    }

    /// Whether every flag of `other` is also in `self`
    pub fn is_superset(&self, other: &Self) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Whether no flag is set
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Flags in declaration order
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        T::iter().filter(move |f| self.contains(*f))
    }

    /// Flags of `self` missing from `supported`
    pub fn missing_from(&self, supported: &Self) -> Vec<T> {
        self.iter().filter(|f| !supported.contains(*f)).collect()
    }
}

impl<T: BitFlag> FromIterator<T> for Bitfield<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::empty();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

impl<T: BitFlag> FromStr for Bitfield<T> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "none" {
            return Ok(Self::empty());
        }
        s.split(';')
            .map(|name| {
                T::from_str(name).map_err(|_| format!("unknown flag '{}'", name))
            })
            .collect()
    }
}

impl<T: BitFlag> fmt::Display for Bitfield<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&'static str> = self.iter().map(Into::into).collect();
        f.write_str(&names.join(";"))
    }
}

impl<T: BitFlag> fmt::Debug for Bitfield<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitfield({})", self)
    }
}

impl<T> Clone for Bitfield<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Bitfield<T> {}

impl<T> PartialEq for Bitfield<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Eq for Bitfield<T> {}

impl<T: BitFlag> Default for Bitfield<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: BitFlag> Serialize for Bitfield<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<&'static str> = self.iter().map(Into::into).collect();
        names.serialize(serializer)
    }
}

impl<'de, T: BitFlag> Deserialize<'de> for Bitfield<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names
            .iter()
            .map(|name| {
                T::from_str(name)
                    .map_err(|_| serde::de::Error::custom(format!("unknown flag '{}'", name)))
            })
            .collect()
    }
}

/// Structured package identifier `name;version;arch;origin`
///
/// Only the framing is checked; the engine never looks at the components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId(String);

impl PackageId {
    /// Validate the framing of a package id
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.split(';').count() != 4 {
            return Err(format!(
                "package id '{}' must have four ';'-separated fields",
                s
            ));
        }
        if s.starts_with(';') {
            return Err(format!("package id '{}' has an empty name", s));
        }
        if s.contains(RESERVED_CHARS) {
            return Err(format!("package id '{}' contains a reserved character", s));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PackageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.0
    }
}

/// Kind of distribution upgrade
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
pub enum UpgradeKind {
    Minimal,
    #[default]
    Default,
    Complete,
}

/// Client environment exported to the backend process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hints {
    /// Locale for backend messages (`LANG`)
    pub locale: Option<String>,
    /// Run with reduced priority
    pub background: bool,
    /// The client can answer questions
    pub interactive: bool,
    /// Maximum acceptable metadata age in seconds
    pub cache_age: Option<u32>,
}

impl Hints {
    /// Environment variables describing these hints
    pub fn to_env(&self) -> Vec<(String, String)> {
        let flag = |b: bool| if b { "TRUE" } else { "FALSE" }.to_string();
        let mut env = vec![
            ("BACKGROUND".to_string(), flag(self.background)),
            ("INTERACTIVE".to_string(), flag(self.interactive)),
        ];
        if let Some(ref locale) = self.locale {
            env.push(("LANG".to_string(), locale.clone()));
        }
        if let Some(age) = self.cache_age {
            env.push(("CACHE_AGE".to_string(), age.to_string()));
        }
        env
    }
}

/// Parameters of a transaction
///
/// Which fields a role uses is fixed by its argument contract
/// (see [`crate::backend::codec::arguments`]); fields a role does not use
/// must be left at their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Run on this backend instead of the first capable one
    pub backend: Option<String>,
    pub filters: FilterSet,
    pub flags: TransactionFlags,
    pub package_ids: Vec<PackageId>,
    /// Search terms, package names, provides or file paths
    pub values: Vec<String>,
    pub recursive: bool,
    pub allow_deps: bool,
    pub autoremove: bool,
    pub force: bool,
    pub repo_id: Option<String>,
    pub enabled: Option<bool>,
    pub directory: Option<PathBuf>,
    pub distro_id: Option<String>,
    pub upgrade_kind: UpgradeKind,
    pub hints: Hints,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_flags(mut self, flags: TransactionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_package_ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = PackageId>,
    {
        self.package_ids = ids.into_iter().collect();
        self
    }

    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_allow_deps(mut self, allow_deps: bool) -> Self {
        self.allow_deps = allow_deps;
        self
    }

    pub fn with_autoremove(mut self, autoremove: bool) -> Self {
        self.autoremove = autoremove;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_repo(mut self, repo_id: impl Into<String>, enabled: bool) -> Self {
        self.repo_id = Some(repo_id.into());
        self.enabled = Some(enabled);
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_distro_upgrade(mut self, distro_id: impl Into<String>, kind: UpgradeKind) -> Self {
        self.distro_id = Some(distro_id.into());
        self.upgrade_kind = kind;
        self
    }

    pub fn with_hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }
}
