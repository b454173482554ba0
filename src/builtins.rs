//! Host functions generated code can call without an `extern` declaration.

use std::io::Write;

use crate::ast::Prototype;

/// writes `x` to stderr as a single character
pub extern "C" fn putchard(x: f64) -> f64 {
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(&[x as u8]);
    let _ = stderr.flush();
    0.0
}

/// writes `x` to stderr followed by a newline
pub extern "C" fn printd(x: f64) -> f64 {
    eprintln!("{:.6}", x);
    0.0
}

type Builtin = extern "C" fn(f64) -> f64;

/// name and address of every host builtin
pub fn symbols() -> Vec<(&'static str, usize)> {
    vec![
        ("putchard", putchard as Builtin as usize),
        ("printd", printd as Builtin as usize),
    ]
}

/// signatures the code generator knows about before any source is read
pub fn prototypes() -> Vec<Prototype> {
    symbols()
        .into_iter()
        .map(|(name, _)| Prototype {
            name: name.to_string(),
            args: vec!["x".to_string()],
        })
        .collect()
}
