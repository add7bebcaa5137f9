use std::fmt;

use rustpython_parser::ast::{self, Expr, Pattern, Ranged, Stmt};
use rustpython_parser::{Mode, ParseError};

/// Calls that evaluate code, import dynamically, introspect namespaces,
/// reflect on attributes, read input or open files
const DENIED_CALLS: &[&str] = &[
    "__import__",
    "breakpoint",
    "compile",
    "delattr",
    "dir",
    "eval",
    "exec",
    "getattr",
    "globals",
    "hasattr",
    "input",
    "locals",
    "open",
    "setattr",
    "vars",
];

/// Top-level packages for process, file and network access, serialization
/// and interpreter internals
const DENIED_MODULES: &[&str] = &[
    "asyncio",
    "builtins",
    "code",
    "codeop",
    "ctypes",
    "ftplib",
    "gc",
    "http",
    "importlib",
    "inspect",
    "io",
    "marshal",
    "multiprocessing",
    "os",
    "pathlib",
    "pickle",
    "posix",
    "pty",
    "shelve",
    "shutil",
    "signal",
    "socket",
    "subprocess",
    "sys",
    "tempfile",
    "threading",
    "urllib",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditVerdict {
    pub safe: bool,
    pub reason: Option<String>,
    /// The source did not parse, so nothing was vetted
    pub syntax_error: bool,
}

impl AuditVerdict {
    fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
            syntax_error: false,
        }
    }

    fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
            syntax_error: false,
        }
    }

    fn unparsable(source: &str, err: &ParseError) -> Self {
        Self {
            safe: false,
            reason: Some(format!(
                "SyntaxError: {} (line {})",
                err.error,
                line_of(source, usize::from(err.offset))
            )),
            syntax_error: true,
        }
    }
}

/// Static pre-execution scan of a submission. Nothing in `source` is run.
pub struct SourceAuditor;

impl SourceAuditor {
    pub fn audit(source: &str) -> AuditVerdict {
        if source.trim().is_empty() {
            return AuditVerdict::unsafe_because("empty source");
        }
        let body = match rustpython_parser::parse(source, Mode::Module, "<submission>") {
            Ok(ast::Mod::Module(module)) => module.body,
            Ok(_) => Vec::new(),
            Err(err) => return AuditVerdict::unparsable(source, &err),
        };
        match (Scanner { source }).block(&body) {
            Ok(()) => AuditVerdict::safe(),
            Err(violation) => {
                log::debug!("Audit rejected submission: {violation}");
                AuditVerdict::unsafe_because(violation.to_string())
            }
        }
    }
}

#[derive(Debug)]
enum Construct {
    Call(String),
    Import(String),
    Attribute(String),
}

#[derive(Debug)]
struct Violation {
    construct: Construct,
    line: usize,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.construct {
            Construct::Call(name) => write!(f, "call to '{name}' is not allowed")?,
            Construct::Import(name) => write!(f, "import of module '{name}' is not allowed")?,
            Construct::Attribute(name) => {
                write!(f, "access to attribute '{name}' is not allowed")?
            }
        }
        write!(f, " (line {})", self.line)
    }
}

type Scan = Result<(), Violation>;

/// 1-based line holding byte `offset`
fn line_of(source: &str, offset: usize) -> usize {
    let offset = offset.min(source.len());
    source.as_bytes()[..offset]
        .iter()
        .filter(|&&byte| byte == b'\n')
        .count()
        + 1
}

fn module_denied(path: &str) -> bool {
    let package = path.split('.').next().unwrap_or(path);
    DENIED_MODULES.contains(&package)
}

/// Walks every node of a parsed module. The matches are exhaustive, so a
/// node kind added to the grammar has to be handled here before it builds.
struct Scanner<'a> {
    source: &'a str,
}

impl Scanner<'_> {
    fn deny(&self, construct: Construct, node: &impl Ranged) -> Scan {
        Err(Violation {
            construct,
            line: line_of(self.source, usize::from(node.start())),
        })
    }

    fn block(&self, body: &[Stmt]) -> Scan {
        body.iter().try_for_each(|node| self.stmt(node))
    }

    fn exprs(&self, items: &[Expr]) -> Scan {
        items.iter().try_for_each(|node| self.expr(node))
    }

    fn optional(&self, node: Option<&Expr>) -> Scan {
        node.map_or(Ok(()), |node| self.expr(node))
    }

    fn stmt(&self, node: &Stmt) -> Scan {
        match node {
            Stmt::FunctionDef(ast::StmtFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                type_params,
                ..
            })
            | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                type_params,
                ..
            }) => {
                self.exprs(decorator_list)?;
                self.type_params(type_params)?;
                self.arguments(args)?;
                self.optional(returns.as_deref())?;
                self.block(body)
            }
            Stmt::ClassDef(ast::StmtClassDef {
                bases,
                keywords,
                body,
                decorator_list,
                type_params,
                ..
            }) => {
                self.exprs(decorator_list)?;
                self.type_params(type_params)?;
                self.exprs(bases)?;
                self.keywords(keywords)?;
                self.block(body)
            }
            Stmt::Return(ast::StmtReturn { value, .. }) => self.optional(value.as_deref()),
            Stmt::Delete(ast::StmtDelete { targets, .. }) => self.exprs(targets),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.exprs(targets)?;
                self.expr(value)
            }
            Stmt::TypeAlias(ast::StmtTypeAlias {
                name,
                type_params,
                value,
                ..
            }) => {
                self.expr(name)?;
                self.type_params(type_params)?;
                self.expr(value)
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.expr(target)?;
                self.expr(value)
            }
            Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.expr(target)?;
                self.expr(annotation)?;
                self.optional(value.as_deref())
            }
            Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            })
            | Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.expr(target)?;
                self.expr(iter)?;
                self.block(body)?;
                self.block(orelse)
            }
            Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            })
            | Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.expr(test)?;
                self.block(body)?;
                self.block(orelse)
            }
            Stmt::With(ast::StmtWith { items, body, .. })
            | Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                for item in items {
                    self.expr(&item.context_expr)?;
                    self.optional(item.optional_vars.as_deref())?;
                }
                self.block(body)
            }
            Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                self.expr(subject)?;
                for case in cases {
                    self.pattern(&case.pattern)?;
                    self.optional(case.guard.as_deref())?;
                    self.block(&case.body)?;
                }
                Ok(())
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.optional(exc.as_deref())?;
                self.optional(cause.as_deref())
            }
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.block(body)?;
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    self.optional(handler.type_.as_deref())?;
                    self.block(&handler.body)?;
                }
                self.block(orelse)?;
                self.block(finalbody)
            }
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.expr(test)?;
                self.optional(msg.as_deref())
            }
            Stmt::Import(ast::StmtImport { names, .. }) => {
                match names.iter().find(|alias| module_denied(alias.name.as_str())) {
                    Some(alias) => {
                        self.deny(Construct::Import(alias.name.as_str().to_owned()), node)
                    }
                    None => Ok(()),
                }
            }
            Stmt::ImportFrom(ast::StmtImportFrom { module, .. }) => match module {
                Some(name) if module_denied(name.as_str()) => {
                    self.deny(Construct::Import(name.as_str().to_owned()), node)
                }
                _ => Ok(()),
            },
            Stmt::Expr(ast::StmtExpr { value, .. }) => self.expr(value),
            Stmt::Global(_)
            | Stmt::Nonlocal(_)
            | Stmt::Pass(_)
            | Stmt::Break(_)
            | Stmt::Continue(_) => Ok(()),
        }
    }

    fn arguments(&self, args: &ast::Arguments) -> Scan {
        for arg in args
            .posonlyargs
            .iter()
            .chain(&args.args)
            .chain(&args.kwonlyargs)
        {
            self.optional(arg.def.annotation.as_deref())?;
            self.optional(arg.default.as_deref())?;
        }
        for arg in args.vararg.iter().chain(&args.kwarg) {
            self.optional(arg.annotation.as_deref())?;
        }
        Ok(())
    }

    fn keywords(&self, keywords: &[ast::Keyword]) -> Scan {
        keywords.iter().try_for_each(|keyword| self.expr(&keyword.value))
    }

    fn type_params(&self, params: &[ast::TypeParam]) -> Scan {
        params.iter().try_for_each(|param| match param {
            ast::TypeParam::TypeVar(ast::TypeParamTypeVar { bound, .. }) => {
                self.optional(bound.as_deref())
            }
            ast::TypeParam::ParamSpec(_) | ast::TypeParam::TypeVarTuple(_) => Ok(()),
        })
    }

    fn comprehensions(&self, generators: &[ast::Comprehension]) -> Scan {
        for generator in generators {
            self.expr(&generator.target)?;
            self.expr(&generator.iter)?;
            self.exprs(&generator.ifs)?;
        }
        Ok(())
    }

    fn patterns(&self, patterns: &[Pattern]) -> Scan {
        patterns.iter().try_for_each(|node| self.pattern(node))
    }

    fn pattern(&self, node: &Pattern) -> Scan {
        match node {
            Pattern::MatchValue(ast::PatternMatchValue { value, .. }) => self.expr(value),
            Pattern::MatchSingleton(_) | Pattern::MatchStar(_) => Ok(()),
            Pattern::MatchSequence(ast::PatternMatchSequence { patterns, .. })
            | Pattern::MatchOr(ast::PatternMatchOr { patterns, .. }) => self.patterns(patterns),
            Pattern::MatchMapping(ast::PatternMatchMapping { keys, patterns, .. }) => {
                self.exprs(keys)?;
                self.patterns(patterns)
            }
            Pattern::MatchClass(ast::PatternMatchClass {
                cls,
                patterns,
                kwd_attrs,
                kwd_patterns,
                ..
            }) => {
                if let Some(attr) = kwd_attrs.iter().find(|attr| attr.as_str().starts_with('_')) {
                    return self.deny(Construct::Attribute(attr.as_str().to_owned()), node);
                }
                self.expr(cls)?;
                self.patterns(patterns)?;
                self.patterns(kwd_patterns)
            }
            Pattern::MatchAs(ast::PatternMatchAs { pattern, .. }) => {
                pattern.as_deref().map_or(Ok(()), |inner| self.pattern(inner))
            }
        }
    }

    fn expr(&self, node: &Expr) -> Scan {
        match node {
            Expr::Constant(_) | Expr::Name(_) => Ok(()),
            Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.exprs(values),
            Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.expr(target)?;
                self.expr(value)
            }
            Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.expr(operand),
            Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.arguments(args)?;
                self.expr(body)
            }
            Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.expr(test)?;
                self.expr(body)?;
                self.expr(orelse)
            }
            Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                // `None` keys are `**mapping` entries
                for key in keys.iter().flatten() {
                    self.expr(key)?;
                }
                self.exprs(values)
            }
            Expr::Set(ast::ExprSet { elts, .. })
            | Expr::List(ast::ExprList { elts, .. })
            | Expr::Tuple(ast::ExprTuple { elts, .. }) => self.exprs(elts),
            Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.expr(elt)?;
                self.comprehensions(generators)
            }
            Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.expr(key)?;
                self.expr(value)?;
                self.comprehensions(generators)
            }
            Expr::Await(ast::ExprAwait { value, .. })
            | Expr::YieldFrom(ast::ExprYieldFrom { value, .. })
            | Expr::Starred(ast::ExprStarred { value, .. }) => self.expr(value),
            Expr::Yield(ast::ExprYield { value, .. }) => self.optional(value.as_deref()),
            Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.expr(left)?;
                self.exprs(comparators)
            }
            Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => {
                let target = match func.as_ref() {
                    Expr::Name(ast::ExprName { id, .. }) => Some(id.as_str()),
                    Expr::Attribute(ast::ExprAttribute { attr, .. }) => Some(attr.as_str()),
                    _ => None,
                };
                if let Some(name) = target
                    && DENIED_CALLS.contains(&name)
                {
                    return self.deny(Construct::Call(name.to_owned()), node);
                }
                self.expr(func)?;
                self.exprs(args)?;
                self.keywords(keywords)
            }
            Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                self.expr(value)?;
                self.optional(format_spec.as_deref())
            }
            Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => self.exprs(values),
            Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
                // Innermost access first, so chains report where they start
                self.expr(value)?;
                if attr.as_str().starts_with('_') {
                    return self.deny(Construct::Attribute(attr.as_str().to_owned()), node);
                }
                Ok(())
            }
            Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.expr(value)?;
                self.expr(slice)
            }
            Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(source: &str) -> String {
        let verdict = SourceAuditor::audit(source);
        assert!(!verdict.safe, "expected {source:?} to be rejected");
        verdict.reason.unwrap()
    }

    #[test]
    fn test_accepts_ordinary_code() {
        let source = "import math\nfrom math import sqrt\n\ndef area(r):\n    return math.pi * r ** 2\n\nnames = [s.upper() for s in ['a', 'b']]\n";
        assert_eq!(SourceAuditor::audit(source), AuditVerdict::safe());
    }

    #[test]
    fn test_rejects_empty_source() {
        assert_eq!(rejected(""), "empty source");
        assert_eq!(rejected("  \n\t\n"), "empty source");
    }

    #[test]
    fn test_reports_syntax_errors() {
        let verdict = SourceAuditor::audit("def f(");
        assert!(verdict.syntax_error);
        let reason = verdict.reason.unwrap();
        assert!(reason.starts_with("SyntaxError: "), "{reason}");
        assert!(reason.ends_with("(line 1)"), "{reason}");
        assert!(!SourceAuditor::audit("import os").syntax_error);
    }

    #[test]
    fn test_walks_classes_decorators_and_match() {
        assert_eq!(
            rejected("@cache(open('f'))\ndef f():\n    pass\n"),
            "call to 'open' is not allowed (line 1)"
        );
        assert_eq!(
            rejected("class A(Base, meta=vars(x)):\n    pass\n"),
            "call to 'vars' is not allowed (line 1)"
        );
        assert_eq!(
            rejected("def f(x=getattr(o, 'a')):\n    return x\n"),
            "call to 'getattr' is not allowed (line 1)"
        );
        assert_eq!(
            rejected("match p:\n    case Point(_secret=v):\n        pass\n"),
            "access to attribute '_secret' is not allowed (line 2)"
        );
        assert_eq!(
            rejected("with ctx() as c:\n    {**c.__dict__}\n"),
            "access to attribute '__dict__' is not allowed (line 2)"
        );
        assert!(
            SourceAuditor::audit(
                "class Point:\n    def __init__(self, x):\n        self.x = x\n\ndef gen(*xs):\n    yield from xs\n"
            )
            .safe
        );
    }

    #[test]
    fn test_rejects_denied_calls() {
        for name in DENIED_CALLS {
            let reason = rejected(&format!("x = {name}('1')"));
            assert_eq!(reason, format!("call to '{name}' is not allowed (line 1)"));
        }
        assert_eq!(
            rejected("def f():\n    return [eval(s) for s in 'ab']"),
            "call to 'eval' is not allowed (line 2)"
        );
        assert_eq!(
            rejected("helper.exec('x')"),
            "call to 'exec' is not allowed (line 1)"
        );
        assert_eq!(
            rejected("f = lambda: open('/etc/passwd')"),
            "call to 'open' is not allowed (line 1)"
        );
    }

    #[test]
    fn test_rejects_denied_imports() {
        assert_eq!(
            rejected("import os\nos.system('ls')"),
            "import of module 'os' is not allowed (line 1)"
        );
        assert_eq!(
            rejected("import math, os.path as p"),
            "import of module 'os.path' is not allowed (line 1)"
        );
        assert_eq!(
            rejected("def f():\n    from subprocess import run\n    return run"),
            "import of module 'subprocess' is not allowed (line 2)"
        );
        assert!(SourceAuditor::audit("import ossify").safe);
    }

    #[test]
    fn test_rejects_underscore_attributes() {
        assert_eq!(
            rejected("x = ().__class__.__bases__"),
            "access to attribute '__class__' is not allowed (line 1)"
        );
        assert_eq!(
            rejected("try:\n    pass\nexcept Exception as e:\n    e._hidden = 1"),
            "access to attribute '_hidden' is not allowed (line 4)"
        );
        assert_eq!(
            rejected("y = f'{obj.__dict__}'"),
            "access to attribute '__dict__' is not allowed (line 1)"
        );
    }

    #[test]
    fn test_audit_is_deterministic() {
        let source = "import sys\nprint(1)";
        assert_eq!(SourceAuditor::audit(source), SourceAuditor::audit(source));
    }
}
