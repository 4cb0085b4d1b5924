use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Command;
use log::debug;
use crate::error::{BuildError, BuildResult};
#[cfg(not(windows))]
use crate::toolchain::split_args;
use crate::toolchain::ToolInvocation;

/// Status the folder query reports when a folder does not exist on this machine.
/// Matches the Windows `E_FAIL` HRESULT so both hosts report the same code.
#[cfg_attr(all(windows, not(test)), allow(dead_code))]
pub const FOLDER_NOT_FOUND_STATUS: i32 = 0x8000_4005_u32 as i32;

/// The two "Program Files" locations the toolchain may be installed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownFolder {
    ProgramFilesX86,
    ProgramFiles,
}

impl fmt::Display for KnownFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnownFolder::ProgramFilesX86 => write!(f, "Program Files (x86)"),
            KnownFolder::ProgramFiles => write!(f, "Program Files"),
        }
    }
}

/// Result of a single folder lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderQuery {
    Found(PathBuf),
    /// The folder does not exist here; the caller may try another one.
    NotFound { status: i32 },
    Failed { status: i32 },
}

/// Abstraction for everything the build needs from the host: folder lookups,
/// the process environment and spawning external tools.
/// This allows the pipeline to be tested without a real toolchain installed.
pub trait SystemOps {
    /// Look up a well-known folder.
    fn query_folder(&self, folder: KnownFolder) -> FolderQuery;

    /// Read a variable from this process's own environment.
    ///
    /// Values that are not valid Unicode are returned as they are.
    fn process_var(&self, name: &str) -> Option<OsString>;

    /// Set a variable in this process's own environment.
    fn set_process_var(&self, name: &str, value: &OsStr);

    /// Spawn the program, wait for it to exit and return its exit code.
    fn run_program(&self, invocation: ToolInvocation) -> BuildResult<i32>;
}

/// Options for opening a file that other processes may keep reading, writing
/// or deleting while we hold it.
pub fn shared_open_options() -> OpenOptions {
    #[allow(unused_mut)]
    let mut options = OpenOptions::new();
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        use windows::Win32::Storage::FileSystem::{FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE};
        options.share_mode((FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE).0);
    }
    options
}

/// The real host (Production).
pub struct HostSystem;

impl SystemOps for HostSystem {
    #[cfg(windows)]
    fn query_folder(&self, folder: KnownFolder) -> FolderQuery {
        use std::os::windows::ffi::OsStringExt;
        use windows::Win32::Foundation::{E_FAIL, MAX_PATH};
        use windows::Win32::UI::Shell::{
            CSIDL_PROGRAM_FILES, CSIDL_PROGRAM_FILESX86, SHGFP_TYPE_CURRENT, SHGetFolderPathW,
        };

        let csidl = match folder {
            KnownFolder::ProgramFilesX86 => CSIDL_PROGRAM_FILESX86,
            KnownFolder::ProgramFiles => CSIDL_PROGRAM_FILES,
        };

        let mut buffer = [0u16; MAX_PATH as usize];
        // SHGetFolderPathW writes a NUL-terminated path into a MAX_PATH buffer.
        let result = unsafe {
            SHGetFolderPathW(None, csidl as i32, None, SHGFP_TYPE_CURRENT.0 as u32, &mut buffer)
        };

        match result {
            Ok(()) => {
                let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
                FolderQuery::Found(PathBuf::from(OsString::from_wide(&buffer[..len])))
            }
            Err(e) if e.code() == E_FAIL => FolderQuery::NotFound { status: e.code().0 },
            Err(e) => FolderQuery::Failed { status: e.code().0 },
        }
    }

    #[cfg(not(windows))]
    fn query_folder(&self, folder: KnownFolder) -> FolderQuery {
        // Outside Windows the shell folders are only known through the
        // variables a Windows environment would export (e.g. under Wine).
        let var = match folder {
            KnownFolder::ProgramFilesX86 => "ProgramFiles(x86)",
            KnownFolder::ProgramFiles => "ProgramFiles",
        };
        match std::env::var_os(var) {
            Some(value) if !value.is_empty() => FolderQuery::Found(PathBuf::from(value)),
            _ => FolderQuery::NotFound { status: FOLDER_NOT_FOUND_STATUS },
        }
    }

    fn process_var(&self, name: &str) -> Option<OsString> {
        std::env::var_os(name)
    }

    fn set_process_var(&self, name: &str, value: &OsStr) {
        // SAFETY: the build is single-threaded and the variable is written
        // before any child process is spawned.
        unsafe { std::env::set_var(name, value) };
    }

    fn run_program(&self, invocation: ToolInvocation) -> BuildResult<i32> {
        let mut command = host_command(&invocation);
        for (name, value) in invocation.overlay.resolve(|name| std::env::var_os(name)) {
            command.env(name, value);
        }

        debug!("Running: {} {}", invocation.program, invocation.arguments);

        let status = command.status().map_err(|source| BuildError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        // A child killed by a signal has no exit code.
        Ok(status.code().unwrap_or(-1))
    }
}

/// The argument string is already quoted for the tools' own tokenizer, so it
/// must reach the child command line untouched.
#[cfg(windows)]
fn host_command(invocation: &ToolInvocation) -> Command {
    use std::os::windows::process::CommandExt;
    let mut command = Command::new(&invocation.program);
    command.raw_arg(&invocation.arguments);
    command
}

/// No shell is involved: the argument string is split the way the tools
/// would split it and each token is passed as one argument.
#[cfg(not(windows))]
fn host_command(invocation: &ToolInvocation) -> Command {
    let mut command = Command::new(&invocation.program);
    command.args(split_args(&invocation.arguments));
    command
}

/// A Mock System for Testing.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockSystem {
    pub folders: std::sync::Mutex<std::collections::HashMap<KnownFolder, FolderQuery>>,
    pub exit_codes: std::sync::Mutex<std::collections::HashMap<String, i32>>,
    pub invocations: std::sync::Mutex<Vec<ToolInvocation>>,
    pub environment: std::sync::Mutex<std::collections::HashMap<String, OsString>>,
}

#[cfg(test)]
impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host where `Program Files (x86)` resolves to `dir`.
    pub fn with_program_files(dir: &str) -> Self {
        let system = Self::new();
        system.set_folder(KnownFolder::ProgramFilesX86, FolderQuery::Found(PathBuf::from(dir)));
        system
    }

    pub fn set_folder(&self, folder: KnownFolder, query: FolderQuery) {
        self.folders.lock().unwrap().insert(folder, query);
    }

    pub fn set_exit_code(&self, program: &str, code: i32) {
        self.exit_codes.lock().unwrap().insert(program.to_string(), code);
    }

    /// Names of the programs run so far, in order.
    pub fn programs(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.program.clone())
            .collect()
    }
}

#[cfg(test)]
impl SystemOps for MockSystem {
    fn query_folder(&self, folder: KnownFolder) -> FolderQuery {
        self.folders
            .lock()
            .unwrap()
            .get(&folder)
            .cloned()
            .unwrap_or(FolderQuery::NotFound { status: FOLDER_NOT_FOUND_STATUS })
    }

    fn process_var(&self, name: &str) -> Option<OsString> {
        self.environment.lock().unwrap().get(name).cloned()
    }

    fn set_process_var(&self, name: &str, value: &OsStr) {
        self.environment
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_os_string());
    }

    fn run_program(&self, invocation: ToolInvocation) -> BuildResult<i32> {
        let code = self
            .exit_codes
            .lock()
            .unwrap()
            .get(&invocation.program)
            .copied()
            .unwrap_or(0);
        self.invocations.lock().unwrap().push(invocation);
        Ok(code)
    }
}
