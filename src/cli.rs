use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kaleidoscope")]
#[command(about = "Interactive kaleidoscope jit compiler")]
pub struct Cli {
    /// Read source from a file instead of stdin
    pub file: Option<PathBuf>,

    /// Skip the optimization passes run on every function
    #[arg(long)]
    pub no_optimize: bool,

    /// Do not print the IR of definitions and externs
    #[arg(short, long)]
    pub quiet: bool,

    /// Prompt shown before each top-level construct when stdin is a terminal
    #[arg(long, default_value = "ready> ")]
    pub prompt: String,
}
