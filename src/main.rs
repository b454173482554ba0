mod ast;
mod builtins;
mod cli;
mod codegen;
mod driver;
mod error;
mod jit;
mod lexer;
mod parser;
mod passes;

use std::{
    fs::File,
    io::{self, BufRead, BufReader, IsTerminal},
};

use anyhow::Context as _;
use clap::Parser as _;
use cli::Cli;
use driver::{Driver, DriverOptions};
use inkwell::context::Context;
use lexer::Lexer;
use parser::Parser;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let interactive = cli.file.is_none() && io::stdin().is_terminal();
    let reader: Box<dyn BufRead> = match &cli.file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let options = DriverOptions {
        optimize: !cli.no_optimize,
        dump_ir: !cli.quiet,
        prompt: if interactive { Some(cli.prompt) } else { None },
    };

    let context = Context::create();
    let mut driver = Driver::new(&context, Parser::new(Lexer::new(reader)), options)?;
    driver.run(&mut io::stderr().lock())?;

    Ok(())
}
