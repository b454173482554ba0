use std::collections::HashMap;

use inkwell::{
    builder::{Builder, BuilderError},
    context::Context,
    module::Module,
    types::BasicMetadataTypeEnum,
    values::{BasicMetadataValueEnum, FloatValue, FunctionValue},
    FloatPredicate,
};

use crate::{
    ast::{ASTNode, Expression, Function, Prototype},
    builtins,
    passes::{PassError, PassPipeline},
};

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("unknown variable referenced {0}")]
    UnknownVariable(String),
    #[error("unknown operator {0}")]
    UnknownOperator(char),
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("invalid number of args in call {0} expected {1} found {2}")]
    InvalidCall(String, usize, usize),
    #[error("function {0} already declared with {1} args, found {2}")]
    SignatureMismatch(String, usize, usize),
    #[error("function {0} cannot be redefined")]
    Redefinition(String),
    #[error("failed to verify function {0}")]
    InvalidFunction(String),
    #[error("call to {0} produced no value")]
    MissingValue(String),
    #[error("builder is not positioned inside a function")]
    DetachedBuilder,
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Optimize(#[from] PassError),
}

/// Lowers the AST into the active module. Prototypes outlive the modules they
/// were first declared in, so a function defined in a unit the jit already
/// owns can be re-declared in every later unit.
pub struct Codegen<'a> {
    pub context: &'a Context,
    pub module: Module<'a>,
    pub builder: Builder<'a>,
    named_values: HashMap<String, FloatValue<'a>>,
    prototypes: HashMap<String, Prototype>,
    passes: Option<PassPipeline>,
    unit_count: usize,
}

impl<'a> Codegen<'a> {
    pub fn new(context: &'a Context, passes: Option<PassPipeline>) -> Codegen<'a> {
        let module = context.create_module("kaleidoscope.0");
        let builder = context.create_builder();

        let prototypes = builtins::prototypes()
            .into_iter()
            .map(|proto| (proto.name.clone(), proto))
            .collect();

        Codegen {
            context,
            module,
            builder,
            named_values: HashMap::new(),
            prototypes,
            passes,
            unit_count: 0,
        }
    }

    /// hand out the active module and start accumulating into a fresh one
    pub fn take_module(&mut self) -> Module<'a> {
        self.unit_count += 1;
        let fresh = self
            .context
            .create_module(&format!("kaleidoscope.{}", self.unit_count));
        self.builder.clear_insertion_position();
        std::mem::replace(&mut self.module, fresh)
    }

    fn get_function(&self, name: &str) -> Result<Option<FunctionValue<'a>>, CodegenError> {
        if let Some(func) = self.module.get_function(name) {
            return Ok(Some(func));
        }
        match self.prototypes.get(name) {
            Some(proto) => self.compile_proto(proto).map(Some),
            None => Ok(None),
        }
    }

    fn codegen_expr(&mut self, expr: &Expression) -> Result<FloatValue<'a>, CodegenError> {
        match expr {
            Expression::Literal(value) => Ok(self.context.f64_type().const_float(*value)),
            Expression::Variable(name) => match self.named_values.get(name) {
                Some(var) => Ok(*var),
                None => Err(CodegenError::UnknownVariable(name.clone())),
            },
            Expression::Binary(op, left, right) => {
                let lhs = self.codegen_expr(left)?;
                let rhs = self.codegen_expr(right)?;

                match *op {
                    '+' => Ok(self.builder.build_float_add(lhs, rhs, "addtmp")?),
                    '-' => Ok(self.builder.build_float_sub(lhs, rhs, "subtmp")?),
                    '*' => Ok(self.builder.build_float_mul(lhs, rhs, "multmp")?),
                    '/' => Ok(self.builder.build_float_div(lhs, rhs, "divtmp")?),
                    '<' => {
                        let cmp = self.builder.build_float_compare(
                            FloatPredicate::ULT,
                            lhs,
                            rhs,
                            "cmptmp",
                        )?;
                        // i1 -> 0.0 or 1.0
                        Ok(self.builder.build_unsigned_int_to_float(
                            cmp,
                            self.context.f64_type(),
                            "booltmp",
                        )?)
                    }
                    _ => Err(CodegenError::UnknownOperator(*op)),
                }
            }
            Expression::Call(callee, args) => {
                let func = match self.get_function(callee)? {
                    Some(func) => func,
                    None => return Err(CodegenError::UnknownFunction(callee.clone())),
                };

                let expected = func.count_params() as usize;
                if expected != args.len() {
                    return Err(CodegenError::InvalidCall(callee.clone(), expected, args.len()));
                }

                let mut argsv: Vec<BasicMetadataValueEnum> = Vec::with_capacity(args.len());
                for arg in args {
                    argsv.push(self.codegen_expr(arg)?.into());
                }

                self.builder
                    .build_call(func, argsv.as_slice(), "calltmp")?
                    .try_as_basic_value()
                    .left()
                    .map(|value| value.into_float_value())
                    .ok_or_else(|| CodegenError::MissingValue(callee.clone()))
            }
            Expression::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let f64_type = self.context.f64_type();
                let condition = self.codegen_expr(condition)?;
                let condition = self.builder.build_float_compare(
                    FloatPredicate::ONE,
                    condition,
                    f64_type.const_float(0.0),
                    "ifcond",
                )?;

                let parent = self
                    .builder
                    .get_insert_block()
                    .and_then(|block| block.get_parent())
                    .ok_or(CodegenError::DetachedBuilder)?;
                let then_block = self.context.append_basic_block(parent, "then");
                let else_block = self.context.append_basic_block(parent, "else");
                let merge_block = self.context.append_basic_block(parent, "ifcont");

                self.builder
                    .build_conditional_branch(condition, then_block, else_block)?;

                // nested conditionals move the insertion point, so each arm's
                // incoming block is wherever it finished
                self.builder.position_at_end(then_block);
                let then_value = self.codegen_expr(then)?;
                self.builder.build_unconditional_branch(merge_block)?;
                let then_end = self
                    .builder
                    .get_insert_block()
                    .ok_or(CodegenError::DetachedBuilder)?;

                self.builder.position_at_end(else_block);
                let else_value = self.codegen_expr(otherwise)?;
                self.builder.build_unconditional_branch(merge_block)?;
                let else_end = self
                    .builder
                    .get_insert_block()
                    .ok_or(CodegenError::DetachedBuilder)?;

                self.builder.position_at_end(merge_block);
                let phi = self.builder.build_phi(f64_type, "iftmp")?;
                phi.add_incoming(&[(&then_value, then_end), (&else_value, else_end)]);

                Ok(phi.as_basic_value().into_float_value())
            }
        }
    }

    fn compile_proto(&self, proto: &Prototype) -> Result<FunctionValue<'a>, CodegenError> {
        if let Some(existing) = self.module.get_function(&proto.name) {
            let declared = existing.count_params() as usize;
            if declared != proto.args.len() {
                return Err(CodegenError::SignatureMismatch(
                    proto.name.clone(),
                    declared,
                    proto.args.len(),
                ));
            }
            return Ok(existing);
        }

        let args_types = std::iter::repeat(self.context.f64_type())
            .take(proto.args.len())
            .map(|f| f.into())
            .collect::<Vec<BasicMetadataTypeEnum>>();
        let args_types = args_types.as_slice();

        let fn_type = self.context.f64_type().fn_type(args_types, false);
        let fn_val = self.module.add_function(proto.name.as_str(), fn_type, None);

        for (i, arg) in fn_val.get_param_iter().enumerate() {
            arg.into_float_value().set_name(proto.args[i].as_str());
        }

        Ok(fn_val)
    }

    pub fn compile_extern(&mut self, proto: Prototype) -> Result<FunctionValue<'a>, CodegenError> {
        let fn_val = self.compile_proto(&proto)?;
        self.prototypes.insert(proto.name.clone(), proto);
        Ok(fn_val)
    }

    fn compile_body(
        &mut self,
        llvm_func: FunctionValue<'a>,
        name: &str,
        body: &Expression,
    ) -> Result<(), CodegenError> {
        let body = self.codegen_expr(body)?;

        self.builder.build_return(Some(&body))?;

        if !llvm_func.verify(true) {
            return Err(CodegenError::InvalidFunction(name.to_string()));
        }

        if let Some(passes) = &self.passes {
            passes.run(&self.module)?;
        }

        Ok(())
    }

    /// A definition that fails leaves the registry as it found it.
    pub fn compile_fn(&mut self, function: Function) -> Result<FunctionValue<'a>, CodegenError> {
        let Function {
            prototype: proto,
            body,
        } = function;
        let name = proto.name.clone();
        let args = proto.args.clone();

        // registered first so the body can call itself
        let previous = self.prototypes.insert(name.clone(), proto);

        let res = self.define_fn(&name, &args, &body);
        if res.is_err() {
            match previous {
                Some(proto) => self.prototypes.insert(name, proto),
                None => self.prototypes.remove(&name),
            };
        }
        res
    }

    fn define_fn(
        &mut self,
        name: &str,
        args: &[String],
        body: &Expression,
    ) -> Result<FunctionValue<'a>, CodegenError> {
        let name = name.to_string();
        let llvm_func = match self.get_function(&name)? {
            Some(func) => func,
            None => return Err(CodegenError::UnknownFunction(name)),
        };
        let declared = llvm_func.count_params() as usize;
        if declared != args.len() {
            return Err(CodegenError::SignatureMismatch(name, declared, args.len()));
        }
        if llvm_func.count_basic_blocks() > 0 {
            return Err(CodegenError::Redefinition(name));
        }

        let entry = self.context.append_basic_block(llvm_func, "entry");

        self.builder.position_at_end(entry);

        self.named_values.clear();
        self.named_values.reserve(args.len());

        for (i, arg) in llvm_func.get_param_iter().enumerate() {
            self.named_values
                .insert(args[i].clone(), arg.into_float_value());
        }

        let res = self.compile_body(llvm_func, &name, body);
        self.named_values.clear();

        match res {
            Ok(()) => Ok(llvm_func),
            Err(e) => {
                self.builder.clear_insertion_position();
                unsafe {
                    llvm_func.delete();
                }
                Err(e)
            }
        }
    }

    pub fn compile(&mut self, node: ASTNode) -> Result<FunctionValue<'a>, CodegenError> {
        match node {
            ASTNode::Function(func) | ASTNode::Expression(func) => self.compile_fn(func),
            ASTNode::Extern(proto) => self.compile_extern(proto),
        }
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;

    use super::{Codegen, CodegenError};
    use crate::{ast::ANON_FN_NAME, parser::parse_str, passes::PassPipeline};

    fn compile_str(codegen: &mut Codegen, source: &str) -> Result<(), CodegenError> {
        for node in parse_str(source).unwrap() {
            codegen.compile(node)?;
        }
        Ok(())
    }

    fn module_ir(codegen: &Codegen) -> String {
        codegen.module.print_to_string().to_string()
    }

    #[test]
    fn codegen_works() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        compile_str(&mut codegen, "extern sin(x) def thing(x) sin(x) * x").unwrap();

        let ir = module_ir(&codegen);
        assert!(ir.contains("declare double @sin(double"), "{}", ir);
        assert!(ir.contains("define double @thing(double %x)"), "{}", ir);
        assert!(ir.contains("call double @sin(double %x)"), "{}", ir);
        assert!(ir.contains("fmul double"), "{}", ir);
    }

    #[test]
    fn comparison_is_widened_to_double() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        compile_str(&mut codegen, "def lt(a b) a < b").unwrap();

        let ir = module_ir(&codegen);
        assert!(ir.contains("fcmp ult double %a, %b"), "{}", ir);
        assert!(ir.contains("uitofp i1"), "{}", ir);
    }

    #[test]
    fn conditional_merges_with_phi() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        compile_str(&mut codegen, "def pick(x) if x then 10 else if x < 0 then 20 else 30").unwrap();

        let func = codegen.module.get_function("pick").unwrap();
        assert!(func.verify(false));
        let ir = module_ir(&codegen);
        assert!(ir.contains("fcmp one double %x, 0.000000e+00"), "{}", ir);
        assert_eq!(ir.matches("phi double").count(), 2, "{}", ir);
        assert_eq!(func.count_basic_blocks(), 7);
    }

    #[test]
    fn recursive_definitions_resolve() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        compile_str(
            &mut codegen,
            "def fib(x) if x < 3 then 1 else fib(x - 1) + fib(x - 2)",
        )
        .unwrap();

        let ir = module_ir(&codegen);
        assert_eq!(ir.matches("call double @fib").count(), 2, "{}", ir);
    }

    #[test]
    fn unknown_variable_discards_function() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        let res = compile_str(&mut codegen, "def f(x) x + y");

        assert!(matches!(res, Err(CodegenError::UnknownVariable(ref name)) if name == "y"));
        assert!(codegen.module.get_function("f").is_none());
    }

    #[test]
    fn unknown_function() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        let res = compile_str(&mut codegen, "nothere(1)");

        assert!(matches!(res, Err(CodegenError::UnknownFunction(ref name)) if name == "nothere"));
        assert!(codegen.module.get_function(ANON_FN_NAME).is_none());
    }

    #[test]
    fn prototypes_are_redeclared_in_new_modules() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        compile_str(&mut codegen, "def one(x) x").unwrap();
        let first = codegen.take_module();
        assert!(first.get_function("one").is_some());

        let res = compile_str(&mut codegen, "one(1, 2)");
        assert!(matches!(res, Err(CodegenError::InvalidCall(ref name, 1, 2)) if name == "one"));

        compile_str(&mut codegen, "one(1)").unwrap();
        let ir = module_ir(&codegen);
        assert!(ir.contains("declare double @one(double"), "{}", ir);
    }

    #[test]
    fn failed_definition_keeps_previous_prototype() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        compile_str(&mut codegen, "def foo(x) x + 1").unwrap();
        codegen.take_module();

        let res = compile_str(&mut codegen, "def foo(x y) q");
        assert!(matches!(res, Err(CodegenError::UnknownVariable(ref name)) if name == "q"));
        codegen.take_module();

        compile_str(&mut codegen, "foo(1)").unwrap();
        let res = compile_str(&mut codegen, "foo(1, 2)");
        assert!(matches!(res, Err(CodegenError::InvalidCall(ref name, 1, 2)) if name == "foo"));
    }

    #[test]
    fn failed_first_definition_is_forgotten() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        assert!(compile_str(&mut codegen, "def bad(x) q").is_err());
        codegen.take_module();

        let res = compile_str(&mut codegen, "bad(1)");
        assert!(matches!(res, Err(CodegenError::UnknownFunction(ref name)) if name == "bad"));
    }

    #[test]
    fn mismatched_definition_keeps_extern() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        let res = compile_str(&mut codegen, "extern sin(x) def sin(x y) x");
        assert!(matches!(res, Err(CodegenError::SignatureMismatch(..))));
        codegen.take_module();

        let res = compile_str(&mut codegen, "sin(0, 1)");
        assert!(matches!(res, Err(CodegenError::InvalidCall(ref name, 1, 2)) if name == "sin"));
    }

    #[test]
    fn builtins_need_no_extern() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        compile_str(&mut codegen, "printd(1) + putchard(65)").unwrap();

        let ir = module_ir(&codegen);
        assert!(ir.contains("declare double @printd(double"), "{}", ir);
        assert!(ir.contains("declare double @putchard(double"), "{}", ir);
    }

    #[test]
    fn extern_arity_must_match_definition() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        let res = compile_str(&mut codegen, "extern foo(x) def foo(x y) x");

        assert!(matches!(res, Err(CodegenError::SignatureMismatch(ref name, 1, 2)) if name == "foo"));
    }

    #[test]
    fn function_cannot_be_redefined_in_one_module() {
        let context = Context::create();
        let mut codegen = Codegen::new(&context, None);
        let res = compile_str(&mut codegen, "def foo(x) x def foo(y) y");

        assert!(matches!(res, Err(CodegenError::Redefinition(ref name)) if name == "foo"));
        assert!(codegen.module.get_function("foo").unwrap().verify(false));
    }

    #[test]
    fn passes_fold_common_subexpressions() {
        let context = Context::create();
        let passes = PassPipeline::native().unwrap();
        let mut codegen = Codegen::new(&context, Some(passes));
        compile_str(&mut codegen, "def test(x) (1 + 2 + x) * (x + (1 + 2))").unwrap();

        let ir = module_ir(&codegen);
        assert_eq!(ir.matches("fadd").count(), 1, "{}", ir);
        assert_eq!(ir.matches("fmul").count(), 1, "{}", ir);
    }
}
