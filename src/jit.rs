use std::collections::{HashMap, HashSet};

use inkwell::{
    execution_engine::{ExecutionEngine, JitFunction, UnsafeFunctionPointer},
    module::Module,
    support,
    targets::{InitializationConfig, Target},
    values::FunctionValue,
    OptimizationLevel,
};

use crate::builtins;

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("failed to initialize native target: {0}")]
    Target(String),
    #[error("invalid module: {0}")]
    InvalidModule(String),
    #[error("failed to link units: {0}")]
    Link(String),
    #[error("failed to create execution engine: {0}")]
    Engine(String),
    #[error("unresolved symbol {0}")]
    UnresolvedSymbol(String),
    #[error("symbol not found {0}")]
    SymbolNotFound(String),
}

/// index of a submitted unit, stays valid (as a tombstone) after removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHandle(usize);

enum UnitState<'ctx> {
    Pending(Module<'ctx>),
    Ready {
        engine: ExecutionEngine<'ctx>,
        addresses: HashMap<String, usize>,
    },
}

struct Unit<'ctx> {
    defines: Vec<String>,
    state: UnitState<'ctx>,
}

fn function_name(function: FunctionValue) -> String {
    function.get_name().to_string_lossy().into_owned()
}

fn declared_names(module: &Module) -> Vec<String> {
    module
        .get_functions()
        .filter(|function| function.count_basic_blocks() == 0)
        .map(function_name)
        .filter(|name| !name.starts_with("llvm."))
        .collect()
}

/// Owns every submitted module. Units are compiled the first time one of
/// their symbols is looked up, and declarations are bound at that point to
/// the newest live unit defining them, then the host builtins, then the
/// symbols exported by the process. Pending units that reference each other
/// are linked into a single engine so mutual recursion across top-level
/// definitions works.
pub struct Jit<'ctx> {
    units: Vec<Option<Unit<'ctx>>>,
    host_symbols: HashMap<String, usize>,
}

impl<'ctx> Jit<'ctx> {
    pub fn new() -> Result<Self, JitError> {
        Target::initialize_native(&InitializationConfig::default()).map_err(JitError::Target)?;
        support::load_visible_symbols();

        let host_symbols = builtins::symbols()
            .into_iter()
            .map(|(name, addr)| (name.to_string(), addr))
            .collect();

        Ok(Self {
            units: Vec::new(),
            host_symbols,
        })
    }

    pub fn submit(&mut self, module: Module<'ctx>) -> Result<UnitHandle, JitError> {
        module
            .verify()
            .map_err(|e| JitError::InvalidModule(e.to_string()))?;

        let defines = module
            .get_functions()
            .filter(|function| function.count_basic_blocks() > 0)
            .map(function_name)
            .collect();

        self.units.push(Some(Unit {
            defines,
            state: UnitState::Pending(module),
        }));
        Ok(UnitHandle(self.units.len() - 1))
    }

    /// Returns false for a handle that was already removed. Code from a unit
    /// that was linked together with others is freed once all of them are
    /// gone.
    pub fn remove(&mut self, handle: UnitHandle) -> bool {
        self.units
            .get_mut(handle.0)
            .and_then(Option::take)
            .is_some()
    }

    #[cfg(test)]
    fn live_units(&self) -> usize {
        self.units.iter().flatten().count()
    }

    pub fn lookup(&mut self, name: &str) -> Result<usize, JitError> {
        if let Some(id) = self.definer(name) {
            self.materialize(id)?;
            return self
                .ready_address(id, name)
                .ok_or_else(|| JitError::SymbolNotFound(name.to_string()));
        }

        self.external_address(name)
            .ok_or_else(|| JitError::SymbolNotFound(name.to_string()))
    }

    /// # Safety
    ///
    /// `F` must match the signature the function was generated with.
    pub unsafe fn get_function<F: UnsafeFunctionPointer>(
        &mut self,
        name: &str,
    ) -> Result<JitFunction<'ctx, F>, JitError> {
        let id = self
            .definer(name)
            .ok_or_else(|| JitError::SymbolNotFound(name.to_string()))?;
        self.materialize(id)?;

        match self.units.get(id) {
            Some(Some(Unit {
                state: UnitState::Ready { engine, .. },
                ..
            })) => engine
                .get_function(name)
                .map_err(|_| JitError::SymbolNotFound(name.to_string())),
            _ => Err(JitError::SymbolNotFound(name.to_string())),
        }
    }

    fn definer(&self, name: &str) -> Option<usize> {
        self.units
            .iter()
            .enumerate()
            .rev()
            .find_map(|(id, unit)| match unit {
                Some(unit) if unit.defines.iter().any(|def| def == name) => Some(id),
                _ => None,
            })
    }

    fn pending_module(&self, id: usize) -> Option<&Module<'ctx>> {
        match self.units.get(id) {
            Some(Some(Unit {
                state: UnitState::Pending(module),
                ..
            })) => Some(module),
            _ => None,
        }
    }

    fn ready_address(&self, id: usize, name: &str) -> Option<usize> {
        match self.units.get(id) {
            Some(Some(Unit {
                state: UnitState::Ready { addresses, .. },
                ..
            })) => addresses.get(name).copied(),
            _ => None,
        }
    }

    fn external_address(&self, name: &str) -> Option<usize> {
        self.host_symbols
            .get(name)
            .copied()
            .or_else(|| support::search_for_address_of_symbol(name))
    }

    /// `root` plus every pending unit it reaches through its declarations
    fn pending_closure(&self, root: usize) -> Vec<usize> {
        let mut closure = vec![root];
        let mut next = 0;
        while next < closure.len() {
            let id = closure[next];
            next += 1;

            let module = match self.pending_module(id) {
                Some(module) => module,
                None => continue,
            };
            for name in declared_names(module) {
                if let Some(definer) = self.definer(&name) {
                    if self.pending_module(definer).is_some() && !closure.contains(&definer) {
                        closure.push(definer);
                    }
                }
            }
        }
        closure
    }

    /// Compiles `root` together with every pending unit it reaches. On any
    /// failure all of those units stay pending and keep their symbols.
    fn materialize(&mut self, root: usize) -> Result<(), JitError> {
        if self.pending_module(root).is_none() {
            return Ok(());
        }

        let closure = self.pending_closure(root);
        let internal: HashSet<&str> = closure
            .iter()
            .filter_map(|&id| self.units[id].as_ref())
            .flat_map(|unit| unit.defines.iter().map(String::as_str))
            .collect();

        // resolve everything up front so a failure leaves the units pending
        let mut mappings = HashMap::new();
        for &id in &closure {
            let module = match self.pending_module(id) {
                Some(module) => module,
                None => continue,
            };
            for name in declared_names(module) {
                if internal.contains(name.as_str()) || mappings.contains_key(&name) {
                    continue;
                }
                let addr = match self.definer(&name) {
                    Some(definer) => self.ready_address(definer, &name),
                    None => self.external_address(&name),
                };
                match addr {
                    Some(addr) => mappings.insert(name, addr),
                    None => return Err(JitError::UnresolvedSymbol(name)),
                };
            }
        }

        // link copies so a failed link or engine leaves every unit pending
        let modules = closure
            .iter()
            .filter_map(|&id| self.pending_module(id).cloned())
            .collect();

        let (engine, addresses) = self.finalize(&closure, modules, &mappings)?;
        for (&id, addresses) in closure.iter().zip(addresses) {
            if let Some(unit) = self.units[id].as_mut() {
                unit.state = UnitState::Ready {
                    engine: engine.clone(),
                    addresses,
                };
            }
        }
        Ok(())
    }

    fn finalize(
        &self,
        closure: &[usize],
        modules: Vec<Module<'ctx>>,
        mappings: &HashMap<String, usize>,
    ) -> Result<(ExecutionEngine<'ctx>, Vec<HashMap<String, usize>>), JitError> {
        let mut modules = modules.into_iter();
        let merged = modules
            .next()
            .ok_or_else(|| JitError::Link("no pending module".to_string()))?;
        for module in modules {
            merged
                .link_in_module(module)
                .map_err(|e| JitError::Link(e.to_string()))?;
        }

        let engine = merged
            .create_jit_execution_engine(OptimizationLevel::None)
            .map_err(|e| JitError::Engine(e.to_string()))?;

        for (name, &addr) in mappings {
            if let Some(function) = merged.get_function(name) {
                engine.add_global_mapping(&function, addr);
            }
        }

        let mut all_addresses = Vec::with_capacity(closure.len());
        for &id in closure {
            let mut addresses = HashMap::new();
            if let Some(unit) = &self.units[id] {
                for name in &unit.defines {
                    let addr = engine
                        .get_function_address(name)
                        .map_err(|_| JitError::SymbolNotFound(name.clone()))?;
                    addresses.insert(name.clone(), addr);
                }
            }
            all_addresses.push(addresses);
        }

        Ok((engine, all_addresses))
    }
}
