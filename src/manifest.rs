//! Resource scripts that embed an application manifest.

use std::io::Write;
use std::path::Path;
use log::info;
use crate::error::{BuildError, BuildResult};
use crate::system::shared_open_options;
use crate::toolchain::quote_path;

/// Resource type the loader reads manifests from.
pub const RT_MANIFEST: u16 = 24;
/// Resource id of the manifest used when the executable is started.
pub const CREATEPROCESS_MANIFEST_RESOURCE_ID: u16 = 1;

/// The three-line script binding `manifest` to the manifest resource slot.
pub fn manifest_resource_script(manifest: &Path) -> String {
    format!(
        "#define RT_MANIFEST {}\r\n#define CREATEPROCESS_MANIFEST_RESOURCE_ID {}\r\nCREATEPROCESS_MANIFEST_RESOURCE_ID RT_MANIFEST {}\r\n",
        RT_MANIFEST,
        CREATEPROCESS_MANIFEST_RESOURCE_ID,
        quote_path(manifest)
    )
}

/// Writes the script to `script`, replacing any existing file.
pub fn write_manifest_resource(script: &Path, manifest: &Path) -> BuildResult<()> {
    let mut file = shared_open_options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(script)
        .map_err(|e| BuildError::io(script, e))?;
    file.write_all(manifest_resource_script(manifest).as_bytes())
        .map_err(|e| BuildError::io(script, e))?;
    info!("Wrote resource script {:?}", script);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn script_has_two_defines_and_one_resource_statement() {
        let script = manifest_resource_script(Path::new("app.manifest"));
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(
            lines,
            vec![
                "#define RT_MANIFEST 24",
                "#define CREATEPROCESS_MANIFEST_RESOURCE_ID 1",
                "CREATEPROCESS_MANIFEST_RESOURCE_ID RT_MANIFEST \"app.manifest\"",
            ]
        );
    }

    #[test]
    fn manifest_path_is_quoted() {
        let script = manifest_resource_script(Path::new("..\\My App.manifest"));
        assert!(script.ends_with("RT_MANIFEST \"..\\\\My App.manifest\"\r\n"));
    }

    #[test]
    fn write_overwrites_without_byte_order_mark() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("StartWaitTree.rc");
        std::fs::write(&script, "stale content that is longer than the new script ".repeat(10)).unwrap();

        write_manifest_resource(&script, Path::new("StartWaitTree.manifest")).unwrap();

        let bytes = std::fs::read(&script).unwrap();
        assert!(!bytes.starts_with(&[0xEF, 0xBB, 0xBF]));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            manifest_resource_script(Path::new("StartWaitTree.manifest"))
        );
    }

    #[test]
    fn write_into_missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("missing").join("x.rc");

        match write_manifest_resource(&script, Path::new("x.manifest")) {
            Err(BuildError::Io { path, .. }) => assert_eq!(path, script),
            other => panic!("expected an I/O error, got {:?}", other),
        }
    }
}
