//! # Toolchain
//!
//! Thin wrappers over the three Visual C++ tools. Each builds a fixed command
//! line, runs it through [`SystemOps::run_program`] and turns a non-zero exit
//! code into [`BuildError::ToolFailed`].

use std::path::{Path, PathBuf};
use log::info;
use crate::environment::EnvironmentOverlay;
use crate::error::{BuildError, BuildResult};
use crate::system::SystemOps;

pub const RESOURCE_COMPILER: &str = "rc.exe";
pub const C_COMPILER: &str = "cl.exe";
pub const LINKER: &str = "link.exe";

/// One external program run: the program name, its already-quoted argument
/// string and the variables to overlay onto its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub arguments: String,
    pub overlay: EnvironmentOverlay,
}

impl ToolInvocation {
    pub fn new(program: &str, arguments: &str, overlay: EnvironmentOverlay) -> Self {
        Self {
            program: program.to_string(),
            arguments: arguments.to_string(),
            overlay,
        }
    }
}

/// Wraps `s` in double quotes, escaping every `"` and `\` with a backslash.
///
/// Examples:
/// - `a b` -> `"a b"`
/// - `..\x.rc` -> `"..\\x.rc"`
pub fn quote_arg(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

pub fn quote_path(path: &Path) -> String {
    quote_arg(&path.to_string_lossy())
}

/// Splits an argument string the way the tools read their command line.
///
/// Whitespace outside quotes separates arguments and `"` toggles quoting.
/// Inside quotes a backslash escapes a following `"` or `\`; any other
/// backslash is kept. Inverts [`quote_arg`].
#[cfg_attr(all(windows, not(test)), allow(dead_code))]
pub fn split_args(arguments: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut quoted = false;
    let mut chars = arguments.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            '\\' if quoted => match chars.peek() {
                Some(&next @ ('"' | '\\')) => {
                    current.push(next);
                    chars.next();
                }
                _ => current.push(c),
            },
            c if c.is_whitespace() && !quoted => {
                if started {
                    args.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        args.push(current);
    }
    args
}

/// Where `rc.exe` writes the compiled form of `script`.
pub fn resource_output(script: &Path) -> PathBuf {
    script.with_extension("res")
}

/// The resource compiler, C compiler and linker, all run with the same overlay.
pub struct Toolchain<'a, S: SystemOps> {
    system: &'a S,
    overlay: &'a EnvironmentOverlay,
}

impl<'a, S: SystemOps> Toolchain<'a, S> {
    pub fn new(system: &'a S, overlay: &'a EnvironmentOverlay) -> Self {
        Self { system, overlay }
    }

    /// `rc.exe "<script>"`. Returns the `.res` file written next to the script.
    pub fn compile_resource(&self, script: &Path) -> BuildResult<PathBuf> {
        self.run_or_fail(RESOURCE_COMPILER, &quote_path(script))?;
        Ok(resource_output(script))
    }

    /// Compiles one C file into `object` without the CRT's stack protector,
    /// targeting Windows 2000.
    pub fn compile_source(&self, object: &Path, source: &Path) -> BuildResult<PathBuf> {
        let arguments = format!(
            "/nologo /c /GS- /Fo{} /DNOSTDBOOL /DWINVER=0x0500 /D_WIN32_WINNT=0x0500 {}",
            quote_path(object),
            quote_path(source)
        );
        self.run_or_fail(C_COMPILER, &arguments)?;
        Ok(object.to_path_buf())
    }

    /// Links a console executable with no default libraries and the
    /// `noCrtMain` entry point. `inputs` are passed in the given order.
    pub fn link(&self, output: &Path, inputs: &[PathBuf]) -> BuildResult<PathBuf> {
        let quoted_inputs = inputs
            .iter()
            .map(|p| quote_path(p))
            .collect::<Vec<_>>()
            .join(" ");
        let arguments = format!(
            "/nologo /nodefaultlib /subsystem:console /entry:noCrtMain /fixed:no /largeaddressaware /nxcompat /tsaware /out:{} {}",
            quote_path(output),
            quoted_inputs
        );
        self.run_or_fail(LINKER, &arguments)?;
        Ok(output.to_path_buf())
    }

    fn run_or_fail(&self, program: &str, arguments: &str) -> BuildResult<()> {
        let invocation = ToolInvocation::new(program, arguments, self.overlay.clone());
        let code = self.system.run_program(invocation)?;
        if code != 0 {
            return Err(BuildError::ToolFailed {
                program: program.to_string(),
                arguments: arguments.to_string(),
                code,
            });
        }
        info!("{} finished", program);
        Ok(())
    }
}
