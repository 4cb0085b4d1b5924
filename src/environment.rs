//! # Tool Environment
//!
//! The Visual C++ 2005 tools are not on the PATH by default and expect `Include`
//! and `Lib` to point at their headers and import libraries. This module derives
//! those values from the Program Files directory.
//!
//! - `Include` and `Lib` travel as an [`EnvironmentOverlay`] attached to every spawned tool.
//! - The tool directories are appended to *this* process's `Path`, because the
//!   tools are later started by bare name (`cl.exe`, `link.exe`, ...).

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use log::{debug, info};
use crate::error::{BuildError, BuildResult};
use crate::system::{FolderQuery, KnownFolder, SystemOps};

/// Separator between entries of a search-path variable.
pub const PATH_SEPARATOR: &str = ";";

#[cfg(windows)]
pub const PATH_VAR: &str = "Path";
#[cfg(not(windows))]
pub const PATH_VAR: &str = "PATH";

pub const INCLUDE_VAR: &str = "Include";
pub const LIB_VAR: &str = "Lib";

/// `current;addition`, keeping `current` byte for byte even when it is not
/// valid Unicode.
fn join_values(current: &OsStr, addition: &str) -> OsString {
    let mut joined = OsString::with_capacity(current.len() + PATH_SEPARATOR.len() + addition.len());
    joined.push(current);
    joined.push(PATH_SEPARATOR);
    joined.push(addition);
    joined
}

/// Extends `existing` with `addition`.
///
/// A non-empty existing value keeps its content and gains `;addition`; an
/// absent or empty one is replaced by `addition` alone.
pub fn append_value(existing: Option<&OsStr>, addition: &str) -> OsString {
    match existing {
        Some(current) if !current.is_empty() => join_values(current, addition),
        _ => OsString::from(addition),
    }
}

/// Variables added on top of a child's inherited environment.
///
/// Built once before the first tool runs and never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentOverlay {
    entries: BTreeMap<String, String>,
}

impl EnvironmentOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.entries.insert(name.to_string(), value.to_string());
        self
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Final values for the child, given how the parent environment looks up a name.
    pub fn resolve<F>(&self, lookup: F) -> Vec<(String, OsString)>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        self.entries
            .iter()
            .map(|(name, value)| {
                let existing = lookup(name);
                (name.clone(), append_value(existing.as_deref(), value))
            })
            .collect()
    }
}

/// Finds the Program Files directory the toolchain lives under.
///
/// `Program Files (x86)` is preferred. If the host reports it as missing, the
/// plain `Program Files` folder is tried once; any other failure is final.
pub fn resolve_base_directory(system: &impl SystemOps) -> BuildResult<PathBuf> {
    let mut folder = KnownFolder::ProgramFilesX86;
    let mut query = system.query_folder(folder);

    if let FolderQuery::NotFound { .. } = query {
        // The templates below still name the x86 layout, which may not exist here.
        info!("{} not found, falling back to {}", folder, KnownFolder::ProgramFiles);
        folder = KnownFolder::ProgramFiles;
        query = system.query_folder(folder);
    }

    match query {
        FolderQuery::Found(path) => {
            debug!("Resolved {} to {:?}", folder, path);
            Ok(path)
        }
        FolderQuery::NotFound { status } | FolderQuery::Failed { status } => {
            Err(BuildError::platform_query(folder, status))
        }
    }
}

/// Search paths for the Visual C++ 2005 / Platform SDK tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEnvironment {
    overlay: EnvironmentOverlay,
    search_path: String,
}

impl ToolEnvironment {
    /// Resolve the base directory on `system` and derive the search paths from it.
    pub fn resolve(system: &impl SystemOps) -> BuildResult<Self> {
        let base_dir = resolve_base_directory(system)?;
        Ok(Self::from_base_dir(&base_dir))
    }

    pub fn from_base_dir(base_dir: &Path) -> Self {
        let base = base_dir.to_string_lossy();

        let include = format!(
            "{0}\\Microsoft Visual Studio 8\\VC\\include;{0}\\Microsoft Platform SDK\\Include",
            base
        );
        let lib = format!(
            "{0}\\Microsoft Visual Studio 8\\VC\\lib;{0}\\Microsoft Platform SDK\\Lib",
            base
        );
        let search_path = format!(
            "{0}\\Microsoft Visual Studio 8\\Common7\\IDE;{0}\\Microsoft Visual Studio 8\\VC\\bin",
            base
        );

        Self {
            overlay: EnvironmentOverlay::new()
                .with(INCLUDE_VAR, &include)
                .with(LIB_VAR, &lib),
            search_path,
        }
    }

    /// The `Include`/`Lib` overlay handed to every spawned tool.
    pub fn overlay(&self) -> &EnvironmentOverlay {
        &self.overlay
    }

    /// Tool directories that must be on this process's search path.
    pub fn search_path(&self) -> &str {
        &self.search_path
    }

    /// Append the tool directories to this process's own search path and
    /// return the new value.
    ///
    /// Unlike the child overlay, a defined-but-empty variable still gains a
    /// leading separator; only an undefined one is replaced outright.
    pub fn export_search_path(&self, system: &impl SystemOps) -> OsString {
        let value = match system.process_var(PATH_VAR) {
            Some(current) => join_values(&current, self.search_path()),
            None => OsString::from(self.search_path()),
        };
        system.set_process_var(PATH_VAR, &value);
        debug!("{} is now {:?}", PATH_VAR, value);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockSystem;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn append_to_existing_value_uses_separator() {
        assert_eq!(append_value(Some(OsStr::new("A")), "B"), "A;B");
    }

    #[test]
    fn append_to_missing_or_empty_value_replaces_it() {
        assert_eq!(append_value(None, "B"), "B");
        assert_eq!(append_value(Some(OsStr::new("")), "B"), "B");
    }

    #[test]
    fn overlay_resolves_against_parent_environment() {
        let overlay = EnvironmentOverlay::new()
            .with(INCLUDE_VAR, "C:\\inc")
            .with(LIB_VAR, "C:\\lib");

        let resolved = overlay.resolve(|name| match name {
            "Include" => Some(OsString::from("D:\\sdk\\include")),
            _ => None,
        });

        assert_eq!(
            resolved,
            vec![
                ("Include".to_string(), OsString::from("D:\\sdk\\include;C:\\inc")),
                ("Lib".to_string(), OsString::from("C:\\lib")),
            ]
        );
    }

    #[test]
    fn templates_are_built_from_base_directory() {
        let env = ToolEnvironment::from_base_dir(Path::new("C:\\Program Files (x86)"));

        assert_eq!(
            env.overlay().get(INCLUDE_VAR),
            Some("C:\\Program Files (x86)\\Microsoft Visual Studio 8\\VC\\include;C:\\Program Files (x86)\\Microsoft Platform SDK\\Include")
        );
        assert_eq!(
            env.overlay().get(LIB_VAR),
            Some("C:\\Program Files (x86)\\Microsoft Visual Studio 8\\VC\\lib;C:\\Program Files (x86)\\Microsoft Platform SDK\\Lib")
        );
        assert_eq!(
            env.search_path(),
            "C:\\Program Files (x86)\\Microsoft Visual Studio 8\\Common7\\IDE;C:\\Program Files (x86)\\Microsoft Visual Studio 8\\VC\\bin"
        );
    }

    #[test]
    fn resolve_prefers_x86_folder() {
        let system = MockSystem::with_program_files("C:\\PF86");
        system.set_folder(KnownFolder::ProgramFiles, FolderQuery::Found(PathBuf::from("C:\\PF")));

        assert_eq!(resolve_base_directory(&system).unwrap(), PathBuf::from("C:\\PF86"));
    }

    #[test]
    fn resolve_falls_back_once_when_x86_folder_is_missing() {
        let system = MockSystem::new();
        system.set_folder(KnownFolder::ProgramFiles, FolderQuery::Found(PathBuf::from("C:\\PF")));

        assert_eq!(resolve_base_directory(&system).unwrap(), PathBuf::from("C:\\PF"));
    }

    #[test]
    fn resolve_does_not_fall_back_on_other_failures() {
        let system = MockSystem::new();
        system.set_folder(KnownFolder::ProgramFilesX86, FolderQuery::Failed { status: 5 });
        system.set_folder(KnownFolder::ProgramFiles, FolderQuery::Found(PathBuf::from("C:\\PF")));

        match resolve_base_directory(&system) {
            Err(BuildError::PlatformQuery { folder, status }) => {
                assert_eq!(folder, "Program Files (x86)");
                assert_eq!(status, 5);
            }
            other => panic!("expected a platform query error, got {:?}", other),
        }
    }

    #[test]
    fn resolve_fails_when_fallback_is_missing_too() {
        let system = MockSystem::new();
        match resolve_base_directory(&system) {
            Err(BuildError::PlatformQuery { folder, .. }) => assert_eq!(folder, "Program Files"),
            other => panic!("expected a platform query error, got {:?}", other),
        }
    }

    #[test]
    fn export_appends_to_process_search_path() {
        let system = MockSystem::new();
        system.set_process_var(PATH_VAR, OsStr::new("C:\\Windows"));
        let env = ToolEnvironment::from_base_dir(Path::new("C:\\PF"));

        let value = env.export_search_path(&system);

        assert_eq!(value, OsString::from(format!("C:\\Windows;{}", env.search_path())));
        assert_eq!(system.process_var(PATH_VAR), Some(value));
    }

    #[test]
    fn export_without_process_search_path_sets_it() {
        let system = MockSystem::new();
        let env = ToolEnvironment::from_base_dir(Path::new("C:\\PF"));

        env.export_search_path(&system);

        assert_eq!(system.process_var(PATH_VAR), Some(OsString::from(env.search_path())));
    }

    #[cfg(unix)]
    #[test]
    fn non_unicode_values_are_appended_to_not_replaced() {
        use std::os::unix::ffi::{OsStrExt, OsStringExt};

        let existing = OsStr::from_bytes(b"C:\\old\xff");
        assert_eq!(append_value(Some(existing), "B").into_vec(), b"C:\\old\xff;B".to_vec());

        let system = MockSystem::new();
        system.set_process_var(PATH_VAR, existing);
        let env = ToolEnvironment::from_base_dir(Path::new("C:\\PF"));

        let value = env.export_search_path(&system).into_vec();

        let mut expected = b"C:\\old\xff;".to_vec();
        expected.extend_from_slice(env.search_path().as_bytes());
        assert_eq!(value, expected);
    }

    #[test]
    fn fallback_is_not_reported_above_info() {
        crate::log_capture::install();
        let system = MockSystem::new();
        system.set_folder(KnownFolder::ProgramFiles, FolderQuery::Found(PathBuf::from("C:\\PF")));

        resolve_base_directory(&system).unwrap();

        let records = crate::log_capture::records_containing("falling back to Program Files");
        assert!(!records.is_empty());
        assert!(records.iter().all(|(level, _)| *level == log::Level::Info));
    }

    proptest! {
        #[test]
        fn append_keeps_existing_content_as_prefix(
            existing in "[A-Za-z0-9:\\\\ ]{1,20}",
            addition in "[A-Za-z0-9:\\\\ ]{0,20}"
        ) {
            let merged = append_value(Some(OsStr::new(&existing)), &addition);
            prop_assert_eq!(merged, OsString::from(format!("{};{}", existing, addition)));
        }
    }
}
