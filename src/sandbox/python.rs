//! The restricted Python namespace hosted on an execution unit.

use std::sync::{Arc, Mutex, PoisonError};

use rustpython_vm::compiler::{CompileError, Mode};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::scope::Scope;
use rustpython_vm::signal::UserSignalReceiver;
use rustpython_vm::{
    AsObject, Interpreter, PyObjectRef, PyResult, Settings, TryFromObject, VirtualMachine,
    builtins::PyBaseExceptionRef,
};

use crate::config::SandboxConfig;

/// The one module a submission may import
const IMPORTABLE_MODULE: &str = "math";

/// Everything a submission can name without defining it
const ALLOWED_BUILTINS: &[&str] = &[
    "__build_class__",
    "__name__",
    "abs",
    "all",
    "any",
    "bool",
    "chr",
    "classmethod",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "frozenset",
    "int",
    "isinstance",
    "iter",
    "len",
    "list",
    "map",
    "max",
    "min",
    "next",
    "ord",
    "pow",
    "print",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "zip",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "Exception",
    "ImportError",
    "IndexError",
    "KeyError",
    "LookupError",
    "MemoryError",
    "NameError",
    "NotImplementedError",
    "OverflowError",
    "RecursionError",
    "RuntimeError",
    "StopIteration",
    "TypeError",
    "ValueError",
    "ZeroDivisionError",
];

/// Runs once per unit with the full builtins, before anything submitted.
/// `sys.modules` is cut down so the import fast path only finds `math`.
const SETUP: &str = "\
import builtins
import math
import sys

sys.setrecursionlimit(RECURSION_LIMIT)
sys.modules = {'math': math}
keep = set(KEEP.split())
remove = delattr
for name in [name for name in vars(builtins) if name not in keep]:
    remove(builtins, name)
";

pub const MEMORY_EXHAUSTED: &str = "allocation budget exceeded";
pub const OUTPUT_EXHAUSTED: &str = "output limit exceeded";

/// Creates the interpreter for one unit. `signals` is how the owning context
/// interrupts running code.
pub fn interpreter(signals: UserSignalReceiver) -> Interpreter {
    let mut settings = Settings::default();
    settings.install_signal_handlers = false;
    settings.allow_external_library = false;

    Interpreter::with_init(settings, move |vm| {
        vm.add_native_modules(
            rustpython_stdlib::get_module_inits().filter(|(name, _)| *name == IMPORTABLE_MODULE),
        );
        vm.set_user_signal_channel(signals);
    })
}

/// Printed text of the current step, capped at a byte limit
#[derive(Clone)]
struct OutputBuffer {
    inner: Arc<Mutex<String>>,
    limit: usize,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(String::new())),
            limit,
        }
    }

    fn write(&self, text: &str) -> bool {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() + text.len() > self.limit {
            return false;
        }
        buffer.push_str(text);
        true
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// The submission's globals plus the sink that replaces `sys.stdout`
pub struct Namespace {
    scope: Scope,
    output: OutputBuffer,
}

impl Namespace {
    /// Strips the builtins down to [`ALLOWED_BUILTINS`], restricts imports to
    /// `math` and redirects printing into a per-step buffer
    pub fn restricted(vm: &VirtualMachine, config: &SandboxConfig) -> PyResult<Self> {
        let original_import = vm.builtins.get_attr("__import__", vm)?;

        let setup = vm
            .compile(SETUP, Mode::Exec, "<setup>".to_owned())
            .map_err(|err| vm.new_runtime_error(err.to_string()))?;
        let setup_scope = vm.new_scope_with_builtins();
        setup_scope
            .globals
            .set_item("KEEP", vm.ctx.new_str(ALLOWED_BUILTINS.join(" ")).into(), vm)?;
        setup_scope.globals.set_item(
            "RECURSION_LIMIT",
            vm.ctx.new_int(config.max_call_depth).into(),
            vm,
        )?;
        vm.run_code_obj(setup, setup_scope)?;

        vm.builtins
            .set_attr("__import__", import_hook(vm, original_import), vm)?;

        let output = OutputBuffer::new(usize::try_from(config.output_limit.0).unwrap_or(usize::MAX));
        vm.sys_module
            .set_attr("stdout", writer(vm, output.clone()), vm)?;
        vm.sys_module
            .set_attr("stderr", writer(vm, output.clone()), vm)?;

        let scope = vm.new_scope_with_builtins();
        scope
            .globals
            .set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;
        Ok(Self { scope, output })
    }

    /// Runs the submission's top-level code. What it prints is discarded.
    pub fn define(&self, vm: &VirtualMachine, source: &str) -> Result<(), String> {
        let code = vm
            .compile(source, Mode::Exec, "<submission>".to_owned())
            .map_err(syntax_error)?;
        let result = vm.run_code_obj(code, self.scope.clone());
        self.output.take();
        result.map(drop).map_err(|exc| message(vm, &exc))
    }

    /// Evaluates one test expression. Returns the trimmed printed output, or
    /// `str(result)` when nothing was printed.
    pub fn evaluate(&self, vm: &VirtualMachine, expression: &str) -> Result<String, String> {
        let code = vm
            .compile(expression, Mode::Eval, "<test>".to_owned())
            .map_err(syntax_error)?;
        let value = vm.run_code_obj(code, self.scope.clone());
        let printed = self.output.take();
        let value = value.map_err(|exc| message(vm, &exc))?;

        let printed = printed.trim();
        if !printed.is_empty() {
            return Ok(printed.to_owned());
        }
        value
            .str(vm)
            .map(|text| text.as_str().to_owned())
            .map_err(|exc| message(vm, &exc))
    }

    /// Drops everything the submission defined while the interpreter is
    /// still alive
    pub fn clear(&self, vm: &VirtualMachine) {
        if let Err(exc) = vm.call_method(self.scope.globals.as_object(), "clear", ()) {
            log::debug!("Clearing namespace failed: {}", message(vm, &exc));
        }
    }
}

/// `str(exc)`, which is what a test outcome reports
pub fn message(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    exc.as_object()
        .str(vm)
        .map(|text| text.as_str().to_owned())
        .unwrap_or_else(|_| "unknown error".to_owned())
}

fn syntax_error(err: CompileError) -> String {
    let (line, _) = err.python_location();
    format!("SyntaxError: {} (line {line})", err.error)
}

/// `__import__` replacement that only resolves [`IMPORTABLE_MODULE`]
fn import_hook(vm: &VirtualMachine, original_import: PyObjectRef) -> PyObjectRef {
    vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            let level: i64 = args
                .args
                .get(4)
                .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
                .unwrap_or(0);

            let package = name.split('.').next().unwrap_or_default();
            if level != 0 || package != IMPORTABLE_MODULE {
                return Err(vm.new_import_error(
                    format!("No module named '{name}'"),
                    vm.ctx.new_str(name),
                ));
            }
            original_import.call(args, vm)
        },
    )
    .into()
}

/// A minimal file object whose `write` appends to `output`
fn writer(vm: &VirtualMachine, output: OutputBuffer) -> PyObjectRef {
    let write = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let text: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            if !output.write(&text) {
                return Err(vm.new_runtime_error(OUTPUT_EXHAUSTED.to_owned()));
            }
            Ok(vm.ctx.new_int(text.len()).into())
        },
    );
    let flush = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let file = vm.new_module("<output>", vm.ctx.new_dict(), None);
    let _ = file.set_attr("write", write, vm);
    let _ = file.set_attr("flush", flush, vm);
    let _ = file.set_attr("closed", vm.ctx.new_bool(false), vm);
    file.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_namespace(check: impl FnOnce(&VirtualMachine, &Namespace)) {
        let (_signals, receiver) = rustpython_vm::signal::user_signal_channel();
        let config = SandboxConfig::default();
        interpreter(receiver).enter(|vm| {
            let namespace = Namespace::restricted(vm, &config).unwrap();
            check(vm, &namespace);
        });
    }

    #[test]
    fn test_only_whitelisted_builtins_remain() {
        with_namespace(|vm, namespace| {
            namespace.define(vm, "").unwrap();
            assert_eq!(namespace.evaluate(vm, "len([1, 2])").unwrap(), "2");
            for name in ["open", "eval", "exec", "getattr", "vars", "globals", "input"] {
                assert_eq!(
                    namespace.evaluate(vm, name).unwrap_err(),
                    format!("name '{name}' is not defined")
                );
            }
        });
    }

    #[test]
    fn test_only_math_is_importable() {
        with_namespace(|vm, namespace| {
            namespace
                .define(vm, "import math\nfrom math import sqrt\n")
                .unwrap();
            assert_eq!(namespace.evaluate(vm, "sqrt(16)").unwrap(), "4.0");
            assert_eq!(namespace.evaluate(vm, "math.factorial(5)").unwrap(), "120");
            for module in ["os", "sys", "builtins", "posix", "_io"] {
                assert_eq!(
                    namespace.define(vm, &format!("import {module}")).unwrap_err(),
                    format!("No module named '{module}'")
                );
            }
        });
    }

    #[test]
    fn test_output_is_captured_per_step() {
        with_namespace(|vm, namespace| {
            namespace.define(vm, "print('during definitions')").unwrap();
            assert_eq!(namespace.evaluate(vm, "print('a', 1)").unwrap(), "a 1");
            assert_eq!(namespace.evaluate(vm, "7").unwrap(), "7");
        });
    }

    #[test]
    fn test_output_limit() {
        with_namespace(|vm, namespace| {
            namespace
                .define(vm, "def chatter():\n    while True:\n        print('x' * 1000)\n")
                .unwrap();
            assert_eq!(namespace.evaluate(vm, "chatter()").unwrap_err(), OUTPUT_EXHAUSTED);
            assert_eq!(namespace.evaluate(vm, "'quiet'").unwrap(), "quiet");
        });
    }

    #[test]
    fn test_syntax_errors_name_the_line() {
        with_namespace(|vm, namespace| {
            let reason = namespace.define(vm, "x = 1\nreturn x\n").unwrap_err();
            assert!(reason.starts_with("SyntaxError: "), "{reason}");
            assert!(reason.ends_with("(line 2)"), "{reason}");
            let reason = namespace.evaluate(vm, "1 +").unwrap_err();
            assert!(reason.starts_with("SyntaxError: "), "{reason}");
        });
    }
}
