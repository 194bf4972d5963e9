//! The pieces of the process environment that affect closure validity:
//! the recognized `DYLD_*` variables (recorded on the closure so a cached
//! closure can be invalidated when they change), the boot-args override
//! file, and the load deny list.

use crate::diagnostics::LoadError;

/// Environment variables the builder records on the closure. Anything
/// else is ignored; these change search behavior and therefore closure
/// identity.
pub const RECOGNIZED_ENV_VARS: &[&str] = &[
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
    "DYLD_FALLBACK_FRAMEWORK_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_IMAGE_SUFFIX",
    "DYLD_ROOT_PATH",
];

/// A heap-smasher workaround inherited from the past; kept as a default
/// rather than a constant so embedders can adjust it.
pub const DEFAULT_DENY_LIST: &[&str] = &["/usr/lib/libnetsnmp.5.2.1.dylib"];

#[derive(Debug, Default, Clone)]
pub struct DyldEnv {
    vars: Vec<(String, String)>,
}

impl DyldEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the recognized variables from an environ-style iterator.
    pub fn from_environ<'e>(environ: impl IntoIterator<Item = &'e str>) -> Self {
        let mut env = Self::new();
        for entry in environ {
            if let Some((key, value)) = entry.split_once('=') {
                env.set(key, value);
            }
        }
        env
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if !RECOGNIZED_ENV_VARS.contains(&key) {
            return;
        }
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_owned(),
            None => self.vars.push((key.to_owned(), value.to_owned())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `KEY=value` strings in capture order, the form recorded on the
    /// closure.
    pub fn iter_key_equals_value(&self) -> impl Iterator<Item = String> + '_ {
        self.vars.iter().map(|(k, v)| format!("{k}={v}"))
    }

    fn path_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split(':').filter(|s| !s.is_empty()).map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn library_paths(&self) -> Vec<String> {
        self.path_list("DYLD_LIBRARY_PATH")
    }

    pub fn framework_paths(&self) -> Vec<String> {
        self.path_list("DYLD_FRAMEWORK_PATH")
    }

    pub fn fallback_library_paths(&self) -> Vec<String> {
        self.path_list("DYLD_FALLBACK_LIBRARY_PATH")
    }

    pub fn fallback_framework_paths(&self) -> Vec<String> {
        self.path_list("DYLD_FALLBACK_FRAMEWORK_PATH")
    }

    pub fn insert_libraries(&self) -> Vec<String> {
        self.path_list("DYLD_INSERT_LIBRARIES")
    }

    pub fn image_suffix(&self) -> Option<&str> {
        self.get("DYLD_IMAGE_SUFFIX")
    }

    /// Prefixes applied to absolute search paths (simulator roots).
    pub fn root_paths(&self) -> Vec<String> {
        self.path_list("DYLD_ROOT_PATH")
    }
}

/// Flags from `/var/db/dyld/dyld-bootargs`, honored on internal builds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BootArgs {
    pub force_dyld2: bool,
    pub force_dyld3: bool,
}

pub const BOOT_ARGS_PATH: &str = "/var/db/dyld/dyld-bootargs";

/// Parses `path:options` lines; a path of `*` applies to every
/// executable. Later matching lines override earlier ones.
pub fn parse_boot_args(content: &str, executable_path: &str) -> Result<BootArgs, LoadError> {
    let mut args = BootArgs::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((path, options)) = line.split_once(':') else {
            return Err(LoadError::malformed("dyld-bootargs", "line missing ':'"));
        };
        if path != "*" && path != executable_path {
            continue;
        }
        for option in options.split(',') {
            match option.trim() {
                "force_dyld2=1" => {
                    args.force_dyld2 = true;
                    args.force_dyld3 = false;
                }
                "force_dyld3=1" => {
                    args.force_dyld3 = true;
                    args.force_dyld2 = false;
                }
                "" => {}
                other => {
                    log::debug!("ignoring unknown bootarg option {other:?}");
                }
            }
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_recognized_vars_are_captured() {
        let env = DyldEnv::from_environ([
            "DYLD_LIBRARY_PATH=/a:/b",
            "PATH=/usr/bin",
            "DYLD_INSERT_LIBRARIES=/lib/inject.dylib",
            "HOME=/root",
        ]);
        assert_eq!(env.library_paths(), ["/a", "/b"]);
        assert_eq!(env.insert_libraries(), ["/lib/inject.dylib"]);
        assert_eq!(env.get("PATH"), None);
        let recorded: Vec<_> = env.iter_key_equals_value().collect();
        assert_eq!(
            recorded,
            ["DYLD_LIBRARY_PATH=/a:/b", "DYLD_INSERT_LIBRARIES=/lib/inject.dylib"]
        );
    }

    #[test]
    fn suffix_and_roots_are_captured() {
        let env = DyldEnv::from_environ([
            "DYLD_IMAGE_SUFFIX=_debug",
            "DYLD_ROOT_PATH=/sdka:/sdkb",
        ]);
        assert_eq!(env.image_suffix(), Some("_debug"));
        assert_eq!(env.root_paths(), ["/sdka", "/sdkb"]);
    }

    #[test]
    fn bootargs_wildcard_and_exact_match() {
        let content = "*:force_dyld3=1\n/bin/ls:force_dyld2=1\n";
        assert_eq!(
            parse_boot_args(content, "/bin/cat").unwrap(),
            BootArgs { force_dyld2: false, force_dyld3: true }
        );
        assert_eq!(
            parse_boot_args(content, "/bin/ls").unwrap(),
            BootArgs { force_dyld2: true, force_dyld3: false }
        );
    }

    #[test]
    fn bootargs_malformed_line() {
        assert!(parse_boot_args("no-colon-here\n", "/bin/ls").is_err());
    }
}
