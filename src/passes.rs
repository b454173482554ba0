use inkwell::{
    module::Module,
    passes::PassBuilderOptions,
    targets::{CodeModel, InitializationConfig, RelocMode, Target, TargetMachine},
    OptimizationLevel,
};

/// instruction combining, reassociation, common subexpression elimination
/// and cfg simplification, in that order
pub const PIPELINE: &str = "instcombine,reassociate,gvn,simplifycfg";

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("failed to initialize native target: {0}")]
    Target(String),
    #[error("no target machine available for {0}")]
    Machine(String),
    #[error("optimization failed: {0}")]
    Run(String),
}

pub struct PassPipeline {
    machine: TargetMachine,
}

impl PassPipeline {
    pub fn native() -> Result<Self, PassError> {
        Target::initialize_native(&InitializationConfig::default()).map_err(PassError::Target)?;

        let triple = TargetMachine::get_default_triple();
        let triple_name = triple.as_str().to_string_lossy().into_owned();
        let target = Target::from_triple(&triple)
            .map_err(|e| PassError::Machine(format!("{}: {}", triple_name, e)))?;
        let machine = target
            .create_target_machine(
                &triple,
                &TargetMachine::get_host_cpu_name().to_string(),
                &TargetMachine::get_host_cpu_features().to_string(),
                OptimizationLevel::Default,
                RelocMode::Default,
                CodeModel::JITDefault,
            )
            .ok_or(PassError::Machine(triple_name))?;

        Ok(Self { machine })
    }

    pub fn run(&self, module: &Module) -> Result<(), PassError> {
        module
            .run_passes(PIPELINE, &self.machine, PassBuilderOptions::create())
            .map_err(|e| PassError::Run(e.to_string()))
    }
}
