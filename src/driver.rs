use std::io::{self, BufRead, Write};

use inkwell::{
    context::Context,
    values::{AnyValue, FunctionValue},
};

use crate::{
    ast::{ASTNode, ANON_FN_NAME},
    codegen::Codegen,
    error::Error,
    jit::Jit,
    parser::{Parser, ParserError},
    passes::PassPipeline,
};

type EntryFunc = unsafe extern "C" fn() -> f64;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub optimize: bool,
    pub dump_ir: bool,
    pub prompt: Option<String>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            dump_ir: true,
            prompt: None,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Outcome {
    Defined(String),
    Declared(String),
    Evaluated(f64),
}

pub struct Driver<'ctx, R> {
    parser: Parser<R>,
    codegen: Codegen<'ctx>,
    jit: Jit<'ctx>,
    options: DriverOptions,
}

impl<'ctx, R: BufRead> Driver<'ctx, R> {
    pub fn new(
        context: &'ctx Context,
        parser: Parser<R>,
        options: DriverOptions,
    ) -> Result<Self, Error> {
        let jit = Jit::new()?;
        let passes = if options.optimize {
            Some(PassPipeline::native()?)
        } else {
            None
        };

        Ok(Self {
            parser,
            codegen: Codegen::new(context, passes),
            jit,
            options,
        })
    }

    /// Handle one top-level construct, `None` once the input is exhausted.
    /// A failed parse is not recovered from here, see `recover`.
    pub fn step(&mut self) -> Option<Result<Outcome, Error>> {
        match self.parser.parse_top_level() {
            Ok(Some(node)) => Some(self.handle(node)),
            Ok(None) => None,
            Err(e) => Some(Err(e.into())),
        }
    }

    /// A failed construct may have left declarations behind in the active
    /// module; those are thrown away with it.
    fn compile(&mut self, node: ASTNode) -> Result<FunctionValue<'ctx>, Error> {
        self.codegen.compile(node).map_err(|e| {
            drop(self.codegen.take_module());
            e.into()
        })
    }

    fn handle(&mut self, node: ASTNode) -> Result<Outcome, Error> {
        match node {
            node @ ASTNode::Function(_) => {
                let llvm_func = self.compile(node)?;
                let ir = llvm_func.print_to_string().to_string();
                self.jit.submit(self.codegen.take_module())?;
                Ok(Outcome::Defined(ir))
            }
            node @ ASTNode::Extern(_) => {
                let llvm_func = self.compile(node)?;
                Ok(Outcome::Declared(llvm_func.print_to_string().to_string()))
            }
            node @ ASTNode::Expression(_) => {
                self.compile(node)?;
                let handle = self.jit.submit(self.codegen.take_module())?;

                let result = unsafe { self.jit.get_function::<EntryFunc>(ANON_FN_NAME) }
                    .map(|entry| unsafe { entry.call() });
                self.jit.remove(handle);

                Ok(Outcome::Evaluated(result?))
            }
        }
    }

    /// After a parse failure, drop the token (or bad lexeme) it stopped at.
    /// Codegen and jit failures leave the token stream alone.
    pub fn recover(&mut self, error: &Error) -> Result<(), ParserError> {
        match error {
            Error::Parse(_) => self.parser.skip_token(),
            _ => Ok(()),
        }
    }

    pub fn run<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        loop {
            if let Some(prompt) = &self.options.prompt {
                write!(out, "{}", prompt)?;
                out.flush()?;
            }

            let outcome = match self.step() {
                Some(outcome) => outcome,
                None => break,
            };

            match outcome {
                Ok(Outcome::Defined(ir)) => {
                    if self.options.dump_ir {
                        writeln!(out, "Read function definition:")?;
                        write!(out, "{}", ir)?;
                    }
                }
                Ok(Outcome::Declared(ir)) => {
                    if self.options.dump_ir {
                        writeln!(out, "Read extern:")?;
                        write!(out, "{}", ir)?;
                    }
                }
                Ok(Outcome::Evaluated(value)) => writeln!(out, "Evaluated to {:.6}", value)?,
                Err(e) => {
                    writeln!(out, "Error: {}", e)?;
                    if let Err(e) = self.recover(&e) {
                        writeln!(out, "Error: {}", e)?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;
    use pretty_assertions::assert_eq;

    use super::{Driver, DriverOptions, Outcome};
    use crate::{lexer::Lexer, parser::Parser};

    fn eval(source: &str, optimize: bool) -> Vec<Result<Outcome, String>> {
        let context = Context::create();
        let options = DriverOptions {
            optimize,
            ..DriverOptions::default()
        };
        let mut driver = Driver::new(&context, Parser::from_source(source), options).unwrap();

        let mut res = Vec::new();
        while let Some(outcome) = driver.step() {
            if let Err(e) = &outcome {
                driver.recover(e).unwrap();
            }
            res.push(outcome.map_err(|e| e.to_string()));
        }
        res
    }

    fn values(source: &str) -> Vec<f64> {
        eval(source, true)
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(Outcome::Evaluated(value)) => Some(value),
                _ => None,
            })
            .collect()
    }

    fn run(source: &str) -> String {
        let context = Context::create();
        let options = DriverOptions {
            dump_ir: false,
            ..DriverOptions::default()
        };
        let mut driver = Driver::new(&context, Parser::from_source(source), options).unwrap();
        let mut out = Vec::new();
        driver.run(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn identity_function() {
        assert_eq!(values("def foo(x) x foo(5)"), vec![5.0]);
    }

    #[test]
    fn parameters_without_commas() {
        assert_eq!(values("def add(x y) x+y add(3,4)"), vec![7.0]);
    }

    #[test]
    fn conditionals() {
        assert_eq!(
            values("if 1 then 10 else 20; if 0 then 10 else 20"),
            vec![10.0, 20.0]
        );
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(
            values("1 + 2 * 3; 10 - 4 - 3; 8 / 2; 1 < 2; 2 < 1"),
            vec![7.0, 3.0, 4.0, 1.0, 0.0]
        );
    }

    #[test]
    fn recursion() {
        let source = "def fib(x) if x < 3 then 1 else fib(x - 1) + fib(x - 2)\nfib(10)";
        assert_eq!(values(source), vec![55.0]);
        assert_eq!(
            eval(source, false).last(),
            Some(&Ok(Outcome::Evaluated(55.0)))
        );
    }

    #[test]
    fn undefined_function_is_recoverable() {
        let res = eval("nothere(1) def ok(x) x + 1 ok(1)", true);
        assert_eq!(res.len(), 3);
        assert_eq!(res[0], Err("unknown function nothere".to_string()));
        assert!(matches!(res[1], Ok(Outcome::Defined(_))));
        assert_eq!(res[2], Ok(Outcome::Evaluated(2.0)));
    }

    #[test]
    fn redefinition_replaces_body() {
        assert_eq!(
            values("def f(x) x + 1 f(1) def f(x) x * 10 f(1)"),
            vec![2.0, 10.0]
        );
    }

    #[test]
    fn redefinition_with_new_arity() {
        let res = eval("def f(x) x f(1, 2) def f(x y) x * y f(3, 4)", true);
        assert_eq!(
            res[1],
            Err("invalid number of args in call f expected 1 found 2".to_string())
        );
        assert_eq!(res[3], Ok(Outcome::Evaluated(12.0)));
    }

    #[test]
    fn failed_redefinition_keeps_old_definition() {
        let res = eval("def foo(x) x + 1 def foo(x y) q foo(1)", true);
        assert_eq!(res[1], Err("unknown variable referenced q".to_string()));
        assert_eq!(res[2], Ok(Outcome::Evaluated(2.0)));
    }

    #[test]
    fn unreadable_line_is_recoverable() {
        let context = Context::create();
        let parser = Parser::new(Lexer::new(&b"1 + 2\n\xff\n3 + 4\n"[..]));
        let mut driver = Driver::new(&context, parser, DriverOptions::default()).unwrap();

        let mut res = Vec::new();
        while let Some(outcome) = driver.step() {
            if let Err(e) = &outcome {
                driver.recover(e).unwrap();
            }
            res.push(outcome.map_err(|e| e.to_string()));
        }

        assert_eq!(res.len(), 3);
        assert_eq!(res[0], Ok(Outcome::Evaluated(3.0)));
        assert!(matches!(res[1], Err(ref e) if e.starts_with("failed to read input")));
        assert_eq!(res[2], Ok(Outcome::Evaluated(7.0)));
    }

    #[test]
    fn externs_and_builtins() {
        let res = eval("extern cos(x) cos(0) printd(42) putchard(10)", true);
        assert!(matches!(res[0], Ok(Outcome::Declared(ref ir)) if ir.contains("@cos")));
        assert_eq!(&res[1..], &[
            Ok(Outcome::Evaluated(1.0)),
            Ok(Outcome::Evaluated(0.0)),
            Ok(Outcome::Evaluated(0.0)),
        ]);
    }

    #[test]
    fn unresolved_extern_is_recoverable() {
        let res = eval("extern nosuchsymbolanywhere(x) nosuchsymbolanywhere(1) 3", true);
        assert_eq!(
            res[1],
            Err("unresolved symbol nosuchsymbolanywhere".to_string())
        );
        assert_eq!(res[2], Ok(Outcome::Evaluated(3.0)));
    }

    #[test]
    fn mutual_recursion() {
        let source = "
            extern odd(n)
            def even(n) if n < 1 then 1 else odd(n - 1)
            def odd(n) if n < 1 then 0 else even(n - 1)
            even(10)
            even(7)
        ";
        assert_eq!(values(source), vec![1.0, 0.0]);
    }

    #[test]
    fn definitions_dump_ir() {
        let res = eval("def double(x) x * 2", false);
        match &res[0] {
            Ok(Outcome::Defined(ir)) => {
                assert!(ir.contains("define double @double(double %x)"), "{}", ir);
                assert!(ir.contains("fmul double %x, 2.000000e+00"), "{}", ir);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn run_reports_and_resumes() {
        let out = run("def foo(x) x 1 + ) foo(3)\n1.2.3\n# comment only\nfoo(4)");
        assert_eq!(
            out,
            "Error: unknown token ')' when expecting an expression\n\
             Evaluated to 3.000000\n\
             Error: malformed number '1.2.3'\n\
             Evaluated to 4.000000\n"
        );
    }

    #[test]
    fn run_prints_prompt_and_ir() {
        let context = Context::create();
        let options = DriverOptions {
            prompt: Some("ready> ".to_string()),
            ..DriverOptions::default()
        };
        let mut driver =
            Driver::new(&context, Parser::from_source("extern sin(x); 1"), options).unwrap();
        let mut out = Vec::new();
        driver.run(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.starts_with("ready> Read extern:\n"), "{}", out);
        assert!(out.contains("declare double @sin(double"), "{}", out);
        assert!(out.contains("ready> Evaluated to 1.000000\n"), "{}", out);
        assert!(out.ends_with("ready> "), "{}", out);
    }
}
