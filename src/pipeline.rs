//! # Build Pipeline
//!
//! The single, fixed build plan for StartWaitTree:
//!
//! 1. Write the manifest resource scripts (standard and admin).
//! 2. Compile both scripts with `rc.exe`.
//! 3. Compile `StartWaitTree.c` once with `cl.exe`.
//! 4. Link the standard and admin executables with `link.exe`.
//! 5. Turn on ASLR and high-entropy VA in both executables.
//!
//! Before step 1 the tool environment is resolved and exported. The first
//! failure, in that preamble or in a step, stops the run for good; artifacts
//! of earlier steps stay on disk.

use std::fmt;
use std::path::{Path, PathBuf};
use log::{debug, info};
use serde::Serialize;
use crate::environment::ToolEnvironment;
use crate::error::{BuildError, BuildResult};
use crate::manifest::write_manifest_resource;
use crate::pe::{
    IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE, IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA,
    add_dll_characteristics,
};
use crate::system::SystemOps;
use crate::toolchain::{Toolchain, resource_output};

/// Bits added to both executables after linking.
pub const HARDENING_BITS: u16 = IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE | IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA;

/// Import library every executable links against.
pub const SYSTEM_LIBRARY: &str = "kernel32.lib";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum BuildStep {
    WriteResourceScript { script: PathBuf, manifest: PathBuf },
    CompileResource { script: PathBuf },
    CompileSource { object: PathBuf, source: PathBuf },
    Link { output: PathBuf, inputs: Vec<PathBuf> },
    AddDllCharacteristics { executable: PathBuf, bits: u16 },
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStep::WriteResourceScript { script, manifest } => {
                write!(f, "write {:?} embedding {:?}", script, manifest)
            }
            BuildStep::CompileResource { script } => write!(f, "compile resource {:?}", script),
            BuildStep::CompileSource { object, source } => write!(f, "compile {:?} -> {:?}", source, object),
            BuildStep::Link { output, inputs } => write!(f, "link {:?} from {:?}", output, inputs),
            BuildStep::AddDllCharacteristics { executable, bits } => {
                write!(f, "add DllCharacteristics 0x{:04X} to {:?}", bits, executable)
            }
        }
    }
}

/// The ordered list of steps. Only [`BuildPlan::standard`] builds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    pub steps: Vec<BuildStep>,
}

impl BuildPlan {
    /// The StartWaitTree plan. Artifacts go into `dir`; the C source and the
    /// manifests are read from its parent.
    pub fn standard(dir: &Path) -> Self {
        let sources = dir.join("..");

        let rc = dir.join("StartWaitTree.rc");
        let rc_admin = dir.join("StartWaitTree_Admin.rc");
        let res = resource_output(&rc);
        let res_admin = resource_output(&rc_admin);
        let obj = dir.join("StartWaitTree.obj");
        let exe = dir.join("StartWaitTree.exe");
        let exe_admin = dir.join("StartWaitTree_Admin.exe");

        let steps = vec![
            BuildStep::WriteResourceScript {
                script: rc.clone(),
                manifest: sources.join("StartWaitTree.manifest"),
            },
            BuildStep::WriteResourceScript {
                script: rc_admin.clone(),
                manifest: sources.join("StartWaitTree_Admin.manifest"),
            },
            BuildStep::CompileResource { script: rc },
            BuildStep::CompileResource { script: rc_admin },
            BuildStep::CompileSource {
                object: obj.clone(),
                source: sources.join("StartWaitTree.c"),
            },
            BuildStep::Link {
                output: exe.clone(),
                inputs: vec![obj.clone(), res, PathBuf::from(SYSTEM_LIBRARY)],
            },
            BuildStep::Link {
                output: exe_admin.clone(),
                inputs: vec![obj, res_admin, PathBuf::from(SYSTEM_LIBRARY)],
            },
            BuildStep::AddDllCharacteristics {
                executable: exe,
                bits: HARDENING_BITS,
            },
            BuildStep::AddDllCharacteristics {
                executable: exe_admin,
                bits: HARDENING_BITS,
            },
        ];

        Self { steps }
    }
}

/// Where a pipeline is. Moves forward only; `Failed` and `Succeeded` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    /// Resolving and exporting the tool environment.
    Resolving,
    Running(usize),
    /// `None` when the tool environment could not be resolved, otherwise the
    /// index of the failing step.
    Failed(Option<usize>),
    Succeeded,
}

pub struct BuildPipeline<'a, S: SystemOps> {
    system: &'a S,
    plan: &'a BuildPlan,
    state: PipelineState,
    artifacts: Vec<PathBuf>,
}

impl<'a, S: SystemOps> BuildPipeline<'a, S> {
    pub fn new(system: &'a S, plan: &'a BuildPlan) -> Self {
        Self {
            system,
            plan,
            state: PipelineState::Pending,
            artifacts: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// What each completed step produced, in step order.
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Resolve the tool environment, then run every step in order, stopping
    /// at the first error.
    ///
    /// A pipeline runs at most once. Calling this again after success does
    /// nothing; after a failure it returns [`BuildError::AlreadyFailed`].
    pub fn run(&mut self) -> BuildResult<()> {
        match self.state {
            PipelineState::Pending => {}
            PipelineState::Succeeded => return Ok(()),
            _ => return Err(BuildError::AlreadyFailed),
        }

        self.state = PipelineState::Resolving;
        let environment = match ToolEnvironment::resolve(self.system) {
            Ok(environment) => environment,
            Err(e) => {
                self.state = PipelineState::Failed(None);
                return Err(e);
            }
        };
        environment.export_search_path(self.system);
        let toolchain = Toolchain::new(self.system, environment.overlay());

        let total = self.plan.steps.len();
        for (index, step) in self.plan.steps.iter().enumerate() {
            self.state = PipelineState::Running(index);
            debug!("[{}/{}] {}", index + 1, total, step);

            match self.execute(&toolchain, step) {
                Ok(artifact) => self.artifacts.push(artifact),
                Err(e) => {
                    self.state = PipelineState::Failed(Some(index));
                    return Err(e);
                }
            }
        }

        self.state = PipelineState::Succeeded;
        info!("Build finished ({} steps)", total);
        Ok(())
    }

    /// Runs one step and returns the file it wrote or updated.
    fn execute(&self, toolchain: &Toolchain<'_, S>, step: &BuildStep) -> BuildResult<PathBuf> {
        match step {
            BuildStep::WriteResourceScript { script, manifest } => {
                write_manifest_resource(script, manifest)?;
                Ok(script.clone())
            }
            BuildStep::CompileResource { script } => toolchain.compile_resource(script),
            BuildStep::CompileSource { object, source } => toolchain.compile_source(object, source),
            BuildStep::Link { output, inputs } => toolchain.link(output, inputs),
            BuildStep::AddDllCharacteristics { executable, bits } => {
                add_dll_characteristics(executable, *bits)?;
                Ok(executable.clone())
            }
        }
    }
}

/// Run `plan` on `system` from start to finish.
pub fn run_build(system: &impl SystemOps, plan: &BuildPlan) -> BuildResult<()> {
    let mut pipeline = BuildPipeline::new(system, plan);
    let result = pipeline.run();
    debug!("Pipeline ended in state {:?}", pipeline.state());
    for artifact in pipeline.artifacts() {
        debug!("Produced {:?}", artifact);
    }
    result
}
