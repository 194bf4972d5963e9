//! Error and warning accumulation for closure building and loading.
//!
//! The builder reports at most one fatal error per attempt; warnings
//! (tolerated oddities in old binaries, ignored bad compat versions, etc)
//! accumulate alongside it without halting the build.

use serde::Serialize;
use thiserror::Error;

/// Sandbox operations the host can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SandboxOp {
    FileReadData,
    FileReadMetadata,
    FileMapExecutable,
}

impl SandboxOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileReadData => "file-read-data",
            Self::FileReadMetadata => "file-read-metadata",
            Self::FileMapExecutable => "file-map-executable",
        }
    }
}

impl std::fmt::Display for SandboxOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the closure builder, image validator and runtime
/// loader. Opaque to the host but carrying enough context to format a
/// kernel exit-reason payload.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("{path} is not a mach-o file")]
    NotMachO { path: String },
    #[error("{path} does not contain a slice for the required architecture")]
    WrongArch { path: String },
    #[error("{path} was not built for the required platform")]
    WrongPlatform { path: String },
    #[error("{path} is a static executable")]
    StaticExecutable { path: String },
    #[error("{path} is not a position independent executable")]
    NotPie { path: String },
    #[error("malformed mach-o ({site}): {detail}")]
    Malformed { site: &'static str, detail: String },
    #[error("dependent dylib '{path}' not found, needed by '{client}', tried: {attempted_paths:?}")]
    DependencyMissing {
        client: String,
        path: String,
        attempted_paths: Vec<String>,
    },
    #[error("symbol '{symbol}' not found, expected in '{target}', needed by '{client}'")]
    SymbolMissing {
        client: String,
        target: String,
        symbol: String,
    },
    #[error(
        "compatibility version of '{dep}' is {found} which is less than the {required} required by '{client}'"
    )]
    CompatVersionTooOld {
        client: String,
        dep: String,
        found: DylibVersion,
        required: DylibVersion,
    },
    #[error("code signature of {path} is invalid: {reason}")]
    CodeSignatureInvalid { path: String, reason: String },
    #[error("code signature of {path} changed since closure was built")]
    CodeSignatureChanged { path: String },
    #[error("file {path} changed since closure was built")]
    FileChanged { path: String },
    #[error("sandbox blocked {op} of {path}")]
    SandboxBlocked { path: String, op: SandboxOp },
    #[error("vm_allocate of {size:#x} bytes failed")]
    VmAllocateFailed { size: u64 },
    #[error("mmap failed with errno {errno}")]
    MmapFailed { errno: i32 },
    #[error("loading of {path} is denied")]
    LoadDenied { path: String },
    #[error("closure building is disabled for {path} by boot-args")]
    ClosureBuildDisabled { path: String },
    #[error("libdyld.dylib entry vector is {problem}")]
    LibDyldEntry { problem: &'static str },
    #[error("closure is no longer valid: {reason}")]
    ClosureStale { reason: String },
}

impl LoadError {
    /// A short helper for the pervasive "structurally bad bytes" case.
    pub(crate) fn malformed(site: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            site,
            detail: detail.into(),
        }
    }
}

/// A dylib version number in the `X.Y.Z` packing used by load commands
/// (16.8.8 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DylibVersion(pub u32);

impl std::fmt::Display for DylibVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.0 >> 16,
            (self.0 >> 8) & 0xff,
            self.0 & 0xff
        )
    }
}

/// The error categories the kernel wants called out in an exit reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LaunchErrorKind {
    DylibMissing,
    DylibWrongArch,
    SymbolMissing,
    CompatVersion,
    CodeSignature,
    Malformed,
    Other,
}

/// Structured payload for errors where the host needs more than a string,
/// e.g. to build the `dyld_abort_payload` for the kernel.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchErrorInfo {
    pub kind: LaunchErrorKind,
    pub client: Option<String>,
    pub target: Option<String>,
    pub symbol: Option<String>,
}

impl LaunchErrorInfo {
    pub fn from_error(err: &LoadError) -> Self {
        match err {
            LoadError::DependencyMissing { client, path, .. } => Self {
                kind: LaunchErrorKind::DylibMissing,
                client: Some(client.clone()),
                target: Some(path.clone()),
                symbol: None,
            },
            LoadError::WrongArch { path } => Self {
                kind: LaunchErrorKind::DylibWrongArch,
                client: None,
                target: Some(path.clone()),
                symbol: None,
            },
            LoadError::SymbolMissing {
                client,
                target,
                symbol,
            } => Self {
                kind: LaunchErrorKind::SymbolMissing,
                client: Some(client.clone()),
                target: Some(target.clone()),
                symbol: Some(symbol.clone()),
            },
            LoadError::CompatVersionTooOld { client, dep, .. } => Self {
                kind: LaunchErrorKind::CompatVersion,
                client: Some(client.clone()),
                target: Some(dep.clone()),
                symbol: None,
            },
            LoadError::CodeSignatureInvalid { path, .. }
            | LoadError::CodeSignatureChanged { path } => Self {
                kind: LaunchErrorKind::CodeSignature,
                client: None,
                target: Some(path.clone()),
                symbol: None,
            },
            LoadError::Malformed { .. } => Self {
                kind: LaunchErrorKind::Malformed,
                client: None,
                target: None,
                symbol: None,
            },
            _ => Self {
                kind: LaunchErrorKind::Other,
                client: None,
                target: None,
                symbol: None,
            },
        }
    }
}

/// Carries one fatal error plus any number of warnings.
///
/// The builder threads one of these through every operation; the first
/// error wins and later ones are dropped on the floor, matching the
/// first-error-aborts propagation policy.
#[derive(Debug, Default)]
pub struct Diagnostics {
    error: Option<LoadError>,
    warnings: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Records `err` unless an earlier error is already present.
    pub fn error(&mut self, err: LoadError) {
        if self.error.is_none() {
            self.error = Some(err);
        } else {
            log::debug!("dropping secondary error: {err}");
        }
    }

    pub fn current_error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<LoadError> {
        self.error.take()
    }

    pub fn warning(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        log::warn!("{msg}");
        self.warnings.push(msg);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Structured payload for the current error, if it is one of the kinds
    /// the host formats specially.
    pub fn launch_error_info(&self) -> Option<LaunchErrorInfo> {
        self.error.as_ref().map(LaunchErrorInfo::from_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let mut diag = Diagnostics::new();
        diag.error(LoadError::FileNotFound {
            path: "/a".into(),
        });
        diag.error(LoadError::FileNotFound {
            path: "/b".into(),
        });
        match diag.current_error() {
            Some(LoadError::FileNotFound { path }) => assert_eq!(path, "/a"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn warnings_accumulate_without_halting() {
        let mut diag = Diagnostics::new();
        diag.warning("one");
        diag.warning("two");
        assert!(!diag.has_error());
        assert_eq!(diag.warnings(), ["one", "two"]);
    }

    #[test]
    fn launch_error_info_serializes() {
        let err = LoadError::SymbolMissing {
            client: "/bin/app".into(),
            target: "/usr/lib/libfoo.dylib".into(),
            symbol: "_foo".into(),
        };
        let info = LaunchErrorInfo::from_error(&err);
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("SymbolMissing"));
        assert!(json.contains("_foo"));
    }
}
