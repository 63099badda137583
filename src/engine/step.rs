//! Reference engine that executes JSON step programs.
//!
//! A program is a JSON document:
//!
//! ```json
//! {
//!   "imports": { "log": "console.log" },
//!   "exports": {
//!     "greet": { "params": ["who"], "body": [
//!       { "call": { "target": "log", "args": ["hello", { "$var": "who" }] } },
//!       { "return": { "value": { "$var": "who" } } }
//!     ] }
//!   },
//!   "main": [ { "call": { "target": "greet", "args": ["world"], "into": "r" } } ]
//! }
//! ```
//!
//! Steps are `let`, `call`, `throw` and `return`. Any object of the form
//! `{"$var": name}` inside an expression is replaced by the variable's value.
//! There are no loops; recursion is bounded by the configured call depth and
//! the interrupt flag is polled before every step.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::{
    EngineError, GuestEnv, InterruptHandle, ScriptContext, ScriptEngine, ScriptError, SourceUnit,
    Value, MAX_CALL_DEPTH,
};
use crate::capabilities::{BindingError, BindingKind};
use crate::types::KernelId;

/// Default nesting limit for guest calls.
const DEFAULT_MAX_CALL_DEPTH: u32 = 64;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Program {
    #[serde(default)]
    imports: BTreeMap<String, String>,
    #[serde(default)]
    exports: BTreeMap<String, FunctionDef>,
    #[serde(default)]
    main: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FunctionDef {
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    body: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Step {
    Let {
        name: String,
        value: Value,
    },
    Call {
        target: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        into: Option<String>,
    },
    Throw {
        message: Value,
    },
    Return {
        value: Value,
    },
}

/// A guest function together with the import table of the unit that defined it.
#[derive(Debug)]
struct StoredFunction {
    def: FunctionDef,
    imports: Arc<BTreeMap<String, String>>,
}

struct Frame {
    locals: HashMap<String, Value>,
    imports: Arc<BTreeMap<String, String>>,
}

/// Engine producing [`StepContext`]s.
#[derive(Debug, Clone)]
pub struct StepEngine {
    max_call_depth: u32,
}

impl StepEngine {
    /// Create an engine whose contexts allow `max_call_depth` nested calls,
    /// clamped to [`MAX_CALL_DEPTH`].
    pub fn new(max_call_depth: u32) -> Self {
        Self {
            max_call_depth: max_call_depth.clamp(1, MAX_CALL_DEPTH),
        }
    }
}

impl Default for StepEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALL_DEPTH)
    }
}

impl ScriptEngine for StepEngine {
    fn name(&self) -> &str {
        "step"
    }

    fn create_context(&self, kernel: KernelId) -> Result<Box<dyn ScriptContext>, EngineError> {
        debug!(%kernel, "step context created");
        Ok(Box::new(StepContext {
            kernel,
            globals: HashMap::new(),
            functions: HashMap::new(),
            interrupt: InterruptHandle::new(),
            max_call_depth: self.max_call_depth,
            disposed: false,
        }))
    }
}

/// Execution context of the step engine.
pub struct StepContext {
    kernel: KernelId,
    globals: HashMap<String, Value>,
    functions: HashMap<String, Arc<StoredFunction>>,
    interrupt: InterruptHandle,
    max_call_depth: u32,
    disposed: bool,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("kernel", &self.kernel)
            .field("globals", &self.globals.len())
            .field("functions", &self.functions.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl StepContext {
    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    fn lookup(&self, name: &str, frame: &Frame) -> Result<Value, ScriptError> {
        frame
            .locals
            .get(name)
            .or_else(|| self.globals.get(name))
            .cloned()
            .ok_or_else(|| ScriptError::thrown(format!("{name} is not defined")))
    }

    fn resolve(&self, expr: &Value, frame: &Frame) -> Result<Value, ScriptError> {
        match expr {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(name)) = map.get("$var") {
                        return self.lookup(name, frame);
                    }
                }
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.resolve(value, frame)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, frame))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn run_block(
        &mut self,
        body: &[Step],
        frame: &mut Frame,
        env: &mut dyn GuestEnv,
        depth: u32,
    ) -> Result<Option<Value>, ScriptError> {
        for step in body {
            if self.interrupt.is_triggered() {
                return Err(ScriptError::Interrupted);
            }
            match step {
                Step::Let { name, value } => {
                    let value = self.resolve(value, frame)?;
                    frame.locals.insert(name.clone(), value);
                }
                Step::Call { target, args, into } => {
                    let args = args
                        .iter()
                        .map(|a| self.resolve(a, frame))
                        .collect::<Result<Vec<_>, _>>()?;
                    let imports = Arc::clone(&frame.imports);
                    let result = self.dispatch(target, &args, &imports, env, depth)?;
                    if let Some(name) = into {
                        frame.locals.insert(name.clone(), result);
                    }
                }
                Step::Throw { message } => {
                    let message = match self.resolve(message, frame)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    return Err(ScriptError::Thrown { message });
                }
                Step::Return { value } => return Ok(Some(self.resolve(value, frame)?)),
            }
        }
        Ok(None)
    }

    fn dispatch(
        &mut self,
        target: &str,
        args: &[Value],
        imports: &BTreeMap<String, String>,
        env: &mut dyn GuestEnv,
        depth: u32,
    ) -> Result<Value, ScriptError> {
        if let Some(function) = self.functions.get(target).cloned() {
            return self.invoke(target, &function, args, env, depth);
        }
        let specifier = imports.get(target).map(String::as_str).unwrap_or(target);
        let binding = env.import(specifier)?;
        if let BindingKind::Export = binding.kind() {
            let function = self.functions.get(binding.name()).cloned().ok_or_else(|| {
                ScriptError::thrown(format!("{} is not a function", binding.name()))
            })?;
            return self.invoke(binding.name(), &function, args, env, depth);
        }
        match binding.invoke(args) {
            Ok(value) => Ok(value),
            Err(BindingError::Interrupted) => Err(ScriptError::Interrupted),
            Err(source) => Err(ScriptError::Binding {
                binding: binding.name().to_owned(),
                source,
            }),
        }
    }

    fn invoke(
        &mut self,
        name: &str,
        function: &StoredFunction,
        args: &[Value],
        env: &mut dyn GuestEnv,
        depth: u32,
    ) -> Result<Value, ScriptError> {
        let depth = depth.saturating_add(1);
        if depth > self.max_call_depth {
            return Err(ScriptError::thrown(format!(
                "maximum call depth {} exceeded in {name}",
                self.max_call_depth
            )));
        }
        let mut frame = Frame {
            locals: function
                .def
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), args.get(i).cloned().unwrap_or(Value::Null)))
                .collect(),
            imports: Arc::clone(&function.imports),
        };
        let result = self.run_block(&function.def.body, &mut frame, env, depth)?;
        Ok(result.unwrap_or(Value::Null))
    }
}

impl ScriptContext for StepContext {
    fn define_global(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.globals.insert(name.to_owned(), value);
        Ok(())
    }

    fn evaluate(
        &mut self,
        unit: &SourceUnit,
        env: &mut dyn GuestEnv,
    ) -> Result<Value, ScriptError> {
        self.ensure_live()?;
        let program: Program = serde_json::from_str(&unit.code)
            .map_err(|e| ScriptError::thrown(format!("syntax error in {}: {e}", unit.name)))?;
        let imports = Arc::new(program.imports);

        for (name, def) in program.exports {
            env.export(&name)?;
            self.functions.insert(
                name,
                Arc::new(StoredFunction {
                    def,
                    imports: Arc::clone(&imports),
                }),
            );
        }

        let mut frame = Frame {
            locals: HashMap::new(),
            imports,
        };
        let result = self.run_block(&program.main, &mut frame, env, 0)?;
        Ok(result.unwrap_or(Value::Null))
    }

    fn call(
        &mut self,
        entry: &str,
        args: &[Value],
        env: &mut dyn GuestEnv,
    ) -> Result<Value, ScriptError> {
        self.ensure_live()?;
        let function = self
            .functions
            .get(entry)
            .cloned()
            .ok_or_else(|| ScriptError::thrown(format!("{entry} is not a function")))?;
        if self.interrupt.is_triggered() {
            return Err(ScriptError::Interrupted);
        }
        self.invoke(entry, &function, args, env, 0)
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn dispose(&mut self) {
        self.functions.clear();
        self.globals.clear();
        self.disposed = true;
        debug!(kernel = %self.kernel, "step context disposed");
    }
}
