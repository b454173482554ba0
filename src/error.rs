use crate::{codegen::CodegenError, jit::JitError, parser::ParserError, passes::PassError};

/// everything that can abort one top-level construct
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParserError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Jit(#[from] JitError),
    #[error(transparent)]
    Optimize(#[from] PassError),
}
