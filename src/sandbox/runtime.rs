use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustpython_vm::signal::{self, UserSignal, UserSignalReceiver, UserSignalSender};
use thiserror::Error;

use crate::config::SandboxConfig;

use super::meter::{self, Meter};
use super::python::{self, MEMORY_EXHAUSTED, Namespace};
use super::{CompilationFailure, PrepareError};

/// Room for the recursion limit's worth of interpreter frames in
/// unoptimized builds
const UNIT_STACK_SIZE: usize = 256 << 20;

/// How often a waiting context checks the unit's allocation meter and
/// repeats a pending interrupt
const WATCH_INTERVAL: Duration = Duration::from_millis(2);

enum Command {
    Define(String),
    Evaluate(String),
}

/// One reply per command: the produced text or `str(exception)`
type Reply = Result<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// The expression raised; carries `str(exception)`
    #[error("{0}")]
    Raised(String),
    #[error("timed out after {0} ms")]
    TimedOut(u128),
    /// The unit requested more memory than it may ever hold
    #[error("{}", MEMORY_EXHAUSTED)]
    Exhausted,
    #[error("execution unit is unresponsive")]
    Poisoned,
    #[error("execution unit stopped")]
    Stopped,
}

/// State the context raises and the unit's interpreter observes
struct Tripwire {
    expired: AtomicBool,
    meter: Meter,
}

impl Tripwire {
    /// Interrupt delivered through the interpreter's signal channel. It is
    /// checked between bytecode instructions and only fires while its
    /// condition still holds, so stale deliveries are harmless.
    fn alarm(self: &Arc<Self>) -> UserSignal {
        let tripwire = self.clone();
        Box::new(move |vm| {
            if tripwire.expired.load(Ordering::SeqCst) {
                // Not an `Exception`, so `except Exception` cannot swallow it
                return Err(vm.new_exception_empty(vm.ctx.exceptions.keyboard_interrupt.to_owned()));
            }
            if tripwire.meter.over_budget() {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.memory_error.to_owned(),
                    MEMORY_EXHAUSTED.to_owned(),
                ));
            }
            Ok(())
        })
    }
}

/// Builds execution contexts whose namespace holds only the whitelisted
/// builtins plus whatever the submission defines
pub struct RestrictedRuntime {
    config: SandboxConfig,
}

impl RestrictedRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Starts an execution unit and runs `source` on it exactly once
    pub fn prepare(&self, source: &str) -> Result<ExecutionContext, PrepareError> {
        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let (reply_tx, reply_rx) = mpsc::channel::<Reply>();
        let (signal_tx, signal_rx) = signal::user_signal_channel();
        let tripwire = Arc::new(Tripwire {
            expired: AtomicBool::new(false),
            meter: Meter::new(self.config.allocation_budget.0),
        });

        let unit = thread::Builder::new()
            .name("sandbox-unit".to_string())
            .stack_size(UNIT_STACK_SIZE)
            .spawn({
                let config = self.config.clone();
                let tripwire = tripwire.clone();
                move || run_unit(&config, signal_rx, &tripwire, command_rx, reply_tx)
            })
            .map_err(PrepareError::Spawn)?;

        let mut context = ExecutionContext {
            commands: Some(command_tx),
            replies: reply_rx,
            signals: signal_tx,
            tripwire,
            unit: Some(unit),
            test_timeout: self.config.test_timeout.as_duration(),
            grace_period: self.config.grace_period.as_duration(),
            poisoned: false,
        };

        // Interpreter start-up is trusted and not part of the deadline
        if !matches!(context.replies.recv(), Ok(Ok(_))) {
            return Err(PrepareError::UnitStopped);
        }

        let defined = context
            .send(Command::Define(source.to_string()))
            .and_then(|()| context.await_reply(self.config.definition_timeout.as_duration()));
        match defined {
            Ok(_) => Ok(context),
            Err(EvalError::Raised(reason)) => Err(CompilationFailure { reason }.into()),
            Err(EvalError::TimedOut(ms)) => Err(CompilationFailure {
                reason: format!("definition pass timed out after {ms} ms"),
            }
            .into()),
            Err(err @ EvalError::Exhausted) => Err(CompilationFailure {
                reason: err.to_string(),
            }
            .into()),
            Err(EvalError::Poisoned | EvalError::Stopped) => Err(PrepareError::UnitStopped),
        }
    }
}

/// Handle to the execution unit holding one submission's namespace.
///
/// The namespace never leaves the unit; the handle only exchanges text with
/// it. Dropping the handle stops the unit, which clears the namespace before
/// its interpreter goes away.
pub struct ExecutionContext {
    commands: Option<Sender<Command>>,
    replies: Receiver<Reply>,
    signals: UserSignalSender,
    tripwire: Arc<Tripwire>,
    unit: Option<JoinHandle<()>>,
    test_timeout: Duration,
    grace_period: Duration,
    /// The unit ignored an interrupt and may still be running
    poisoned: bool,
}

impl ExecutionContext {
    /// Evaluates one test expression with a fresh output sink and a fresh
    /// allocation budget. Returns the trimmed printed output, or
    /// `str(result)` when nothing was printed.
    pub fn evaluate(&mut self, expression: &str) -> Result<String, EvalError> {
        if self.poisoned {
            return Err(EvalError::Poisoned);
        }
        self.send(Command::Evaluate(expression.to_string()))?;
        self.await_reply(self.test_timeout)
    }

    fn send(&self, command: Command) -> Result<(), EvalError> {
        let sent = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(command).is_ok());
        if sent { Ok(()) } else { Err(EvalError::Stopped) }
    }

    fn alarm(&self) {
        // Fails only once the unit is gone
        let _ = self.signals.send(self.tripwire.alarm());
    }

    fn await_reply(&mut self, deadline: Duration) -> Result<String, EvalError> {
        let started = Instant::now();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                self.tripwire.expired.store(true, Ordering::SeqCst);
                self.settle();
                return Err(EvalError::TimedOut(deadline.as_millis()));
            }
            match self.replies.recv_timeout(remaining.min(WATCH_INTERVAL)) {
                Ok(reply) => return reply.map_err(EvalError::Raised),
                Err(RecvTimeoutError::Disconnected) => return Err(EvalError::Stopped),
                Err(RecvTimeoutError::Timeout) => self.watch()?,
            }
        }
    }

    fn watch(&mut self) -> Result<(), EvalError> {
        let meter = &self.tripwire.meter;
        if meter.refused() {
            log::warn!("Execution unit requested memory past its ceiling, abandoning it");
            self.poisoned = true;
            return Err(EvalError::Exhausted);
        }
        if meter.over_budget() {
            self.alarm();
        }
        Ok(())
    }

    /// Waits for the interrupted step to reply so the next command starts
    /// from a clean state. The interrupt is repeated until it lands.
    fn settle(&mut self) {
        let started = Instant::now();
        loop {
            self.alarm();
            match self.replies.recv_timeout(WATCH_INTERVAL) {
                Ok(_) => {
                    self.tripwire.expired.store(false, Ordering::SeqCst);
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) if started.elapsed() >= self.grace_period => {
                    log::warn!(
                        "Execution unit ignored interrupt for {} ms, abandoning it",
                        self.grace_period.as_millis()
                    );
                    self.poisoned = true;
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.commands.take();
        let Some(unit) = self.unit.take() else {
            return;
        };
        if self.poisoned {
            // Keep interrupting; a unit that ever reaches its next instruction halts
            self.tripwire.expired.store(true, Ordering::SeqCst);
            self.alarm();
            return;
        }
        // An unpoisoned unit is idle and exits once the commands close
        if unit.join().is_err() {
            log::error!("Execution unit panicked");
        }
    }
}

fn run_unit(
    config: &SandboxConfig,
    signals: UserSignalReceiver,
    tripwire: &Tripwire,
    commands: Receiver<Command>,
    replies: Sender<Reply>,
) {
    let interpreter = python::interpreter(signals);
    interpreter.enter(|vm| {
        let namespace = match Namespace::restricted(vm, config) {
            Ok(namespace) => namespace,
            Err(exc) => {
                log::error!(
                    "Failed to set up the restricted namespace: {}",
                    python::message(vm, &exc)
                );
                return;
            }
        };
        if replies.send(Ok(String::new())).is_err() {
            return;
        }

        let _metered = meter::attach(&tripwire.meter);
        for command in commands.iter() {
            tripwire.meter.begin_step();
            let (reply, last) = match command {
                Command::Define(source) => {
                    let defined = namespace.define(vm, &source).map(|()| String::new());
                    let failed = defined.is_err();
                    (defined, failed)
                }
                Command::Evaluate(expression) => (namespace.evaluate(vm, &expression), false),
            };
            if replies.send(reply).is_err() || last {
                break;
            }
        }
        namespace.clear(vm);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteSize, MilliSecond};

    fn runtime(test_timeout: u64) -> RestrictedRuntime {
        RestrictedRuntime::new(SandboxConfig {
            definition_timeout: MilliSecond(500),
            test_timeout: MilliSecond(test_timeout),
            ..SandboxConfig::default()
        })
    }

    fn compile_error(source: &str) -> String {
        match runtime(500).prepare(source) {
            Err(PrepareError::Compilation(failure)) => failure.reason,
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("expected {source:?} to fail"),
        }
    }

    #[test]
    fn test_definitions_are_reused_across_evaluations() {
        let mut ctx = runtime(500)
            .prepare("count = 0\ndef bump():\n    global count\n    count += 1\n    return count\n")
            .unwrap();
        assert_eq!(ctx.evaluate("bump()").unwrap(), "1");
        assert_eq!(ctx.evaluate("bump()").unwrap(), "2");
        assert_eq!(ctx.evaluate("count").unwrap(), "2");
    }

    #[test]
    fn test_printed_output_wins_over_value() {
        let mut ctx = runtime(500)
            .prepare("def greet(name):\n    print('hi', name)\n    return 0\n")
            .unwrap();
        assert_eq!(ctx.evaluate("greet('bo')").unwrap(), "hi bo");
        assert_eq!(ctx.evaluate("print()").unwrap(), "None");
        assert_eq!(ctx.evaluate("'  padded '").unwrap(), "  padded ");
    }

    #[test]
    fn test_definition_output_is_not_captured() {
        let mut ctx = runtime(500).prepare("print('setup')\n").unwrap();
        assert_eq!(ctx.evaluate("1 + 1").unwrap(), "2");
    }

    #[test]
    fn test_definition_failures() {
        assert!(compile_error("def f(").starts_with("SyntaxError: "));
        assert!(compile_error("x = 1 // 0").contains("by zero"));
        assert_eq!(compile_error("import os"), "No module named 'os'");
        assert_eq!(
            compile_error("while True:\n    pass\n"),
            "definition pass timed out after 500 ms"
        );
    }

    #[test]
    fn test_raised_and_syntax_errors() {
        let mut ctx = runtime(500).prepare("").unwrap();
        assert_eq!(
            ctx.evaluate("undefined_name").unwrap_err(),
            EvalError::Raised("name 'undefined_name' is not defined".to_string())
        );
        assert!(matches!(ctx.evaluate("1 +"), Err(EvalError::Raised(_))));
        assert_eq!(ctx.evaluate("len('abc')").unwrap(), "3");
    }

    #[test]
    fn test_full_language_is_available() {
        let source = "\
def factorial(n):
    return 1 if n < 2 else n * factorial(n - 1)

class Point:
    def __init__(self, x, y):
        self.x = x
        self.y = y

    def norm1(self):
        return abs(self.x) + abs(self.y)

def total(*xs, **named):
    return sum(xs) + sum(named.values())

def count(n):
    for i in range(n):
        yield i
";
        let mut ctx = runtime(500).prepare(source).unwrap();
        assert_eq!(ctx.evaluate("factorial(21)").unwrap(), "51090942171709440000");
        assert_eq!(ctx.evaluate("2**64").unwrap(), "18446744073709551616");
        assert_eq!(ctx.evaluate("Point(3, -4).norm1()").unwrap(), "7");
        assert_eq!(ctx.evaluate("total(1, 2, 3, extra=4)").unwrap(), "10");
        assert_eq!(ctx.evaluate("list(count(3))").unwrap(), "[0, 1, 2]");
        assert_eq!(ctx.evaluate("sum(i * i for i in count(4))").unwrap(), "14");
    }

    #[test]
    fn test_timeout_recovers_for_next_evaluation() {
        let mut ctx = runtime(100)
            .prepare("def spin():\n    while True:\n        pass\n")
            .unwrap();
        assert_eq!(ctx.evaluate("spin()").unwrap_err(), EvalError::TimedOut(100));
        assert_eq!(
            ctx.evaluate("spin()").unwrap_err().to_string(),
            "timed out after 100 ms"
        );
        assert_eq!(ctx.evaluate("2 * 21").unwrap(), "42");
    }

    #[test]
    fn test_timeout_cannot_be_caught() {
        let mut ctx = runtime(100)
            .prepare("def stubborn():\n    while True:\n        try:\n            while True:\n                pass\n        except Exception:\n            pass\n")
            .unwrap();
        assert_eq!(ctx.evaluate("stubborn()").unwrap_err(), EvalError::TimedOut(100));
        assert_eq!(ctx.evaluate("'still alive'").unwrap(), "still alive");
    }

    #[test]
    fn test_allocation_budget_is_per_step() {
        let mut ctx = RestrictedRuntime::new(SandboxConfig {
            test_timeout: MilliSecond(5000),
            allocation_budget: ByteSize(16 << 20),
            ..SandboxConfig::default()
        })
        .prepare("def build(n):\n    return len([0] * n)\n\ndef hog():\n    chunks = []\n    while True:\n        chunks.append('x' * 10000)\n")
        .unwrap();
        // Each call holds about 8 MiB and frees it on return
        for _ in 0..4 {
            assert_eq!(ctx.evaluate("build(1000000)").unwrap(), "1000000");
        }
        assert_eq!(
            ctx.evaluate("hog()").unwrap_err(),
            EvalError::Raised(MEMORY_EXHAUSTED.to_string())
        );
        assert_eq!(ctx.evaluate("build(1000000)").unwrap(), "1000000");
    }

    #[test]
    fn test_contexts_do_not_share_namespaces() {
        let runtime = runtime(500);
        let mut first = runtime.prepare("secret = 41\n").unwrap();
        let mut second = runtime.prepare("").unwrap();
        assert_eq!(first.evaluate("secret + 1").unwrap(), "42");
        assert!(second.evaluate("secret").is_err());
    }
}
