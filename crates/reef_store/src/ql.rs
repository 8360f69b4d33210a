//! The slice of the query language this core evaluates directly.
//!
//! Full query planning and execution live in the query layer; dispatch and
//! merging only need literal terms, variable lookup through lexical scopes,
//! and the small operator set that reduction bases and bodies are written
//! in. Evaluation failures are ordinary values (`RuntimeError`) so a
//! partially failed multi-shard read can report them in-band.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::RuntimeEnvironment;

/// Document values are JSON.
pub type Value = serde_json::Value;

/// Total order over values: type rank first (null < bool < number < string
/// < array < object), then contents.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = cmp_values(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // serde_json maps iterate in key order.
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk).then_with(|| cmp_values(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Value wrapper usable as an ordered-map key (grouping keys).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedJson(pub Value);

impl PartialEq for OrderedJson {
    fn eq(&self, other: &Self) -> bool {
        cmp_values(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for OrderedJson {}

impl PartialOrd for OrderedJson {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedJson {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_values(&self.0, &other.0)
    }
}

/// Evaluation failure attributable to user input. Becomes the `result` of a
/// range read rather than a transport-level error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub message: String,
    pub backtrace: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, backtrace: &Backtrace) -> Self {
        Self {
            message: message.into(),
            backtrace: backtrace.frames.clone(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.message)?;
        for frame in &self.backtrace {
            write!(f, "\n  in {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Evaluation position, threaded through `eval` for error reporting.
#[derive(Clone, Debug, Default)]
pub struct Backtrace {
    frames: Vec<String>,
}

impl Backtrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child backtrace with one more frame.
    pub fn frame(&self, name: &str) -> Self {
        let mut frames = self.frames.clone();
        frames.push(name.to_string());
        Self { frames }
    }
}

/// Stack of lexical scope frames, innermost last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scopes {
    frames: Vec<BTreeMap<String, Value>>,
}

impl Default for Scopes {
    fn default() -> Self {
        Self {
            frames: vec![BTreeMap::new()],
        }
    }
}

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a child frame. Every reduction step of a merge runs in its own
    /// frame so bindings cannot leak between iterations.
    pub fn push_frame(&mut self) {
        self.frames.push(BTreeMap::new());
    }

    pub fn pop_frame(&mut self) {
        assert!(self.frames.len() > 1, "cannot pop the root scope frame");
        self.frames.pop();
    }

    pub fn put_in_scope(&mut self, name: impl Into<String>, value: Value) {
        self.frames
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.into(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }
}

/// Binary operators available to reduction and mapping bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Expression term. Literals, variable lookup, field access, and binary
/// operators; the rest of the language never reaches this core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Datum(Value),
    Var(String),
    Field(Box<Term>, String),
    Binary {
        op: BinOp,
        lhs: Box<Term>,
        rhs: Box<Term>,
    },
}

impl Term {
    pub fn num(n: f64) -> Term {
        Term::Datum(serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null))
    }

    pub fn var(name: &str) -> Term {
        Term::Var(name.to_string())
    }

    pub fn binary(op: BinOp, lhs: Term, rhs: Term) -> Term {
        Term::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn add(lhs: Term, rhs: Term) -> Term {
        Term::binary(BinOp::Add, lhs, rhs)
    }

    pub fn field(of: Term, name: &str) -> Term {
        Term::Field(Box::new(of), name.to_string())
    }
}

/// One-argument function body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub arg: String,
    pub body: Term,
}

impl Mapping {
    pub fn new(arg: &str, body: Term) -> Self {
        Self {
            arg: arg.to_string(),
            body,
        }
    }

    /// The identity mapping.
    pub fn identity() -> Self {
        Self::new("row", Term::var("row"))
    }
}

/// Two-argument fold: `body(var1 = accumulator, var2 = next)` starting from
/// `base`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    pub base: Term,
    pub var1: String,
    pub var2: String,
    pub body: Term,
}

impl Reduction {
    pub fn new(base: Term, var1: &str, var2: &str, body: Term) -> Self {
        Self {
            base,
            var1: var1.to_string(),
            var2: var2.to_string(),
            body,
        }
    }

    /// Numeric sum, the most common reduction.
    pub fn sum() -> Self {
        Self::new(
            Term::num(0.0),
            "acc",
            "row",
            Term::add(Term::var("acc"), Term::var("row")),
        )
    }
}

fn number(value: &Value, what: &str, backtrace: &Backtrace) -> Result<f64, RuntimeError> {
    value.as_f64().ok_or_else(|| {
        RuntimeError::new(format!("expected a number for {what}, got {value}"), backtrace)
    })
}

fn from_f64(n: f64, backtrace: &Backtrace) -> Result<Value, RuntimeError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| RuntimeError::new(format!("non-finite number {n}"), backtrace))
}

/// Evaluate a term against the request environment. May suspend inside the
/// scripting runtime for terms that reach it; everything handled here is
/// pure CPU.
pub fn eval(
    term: &Term,
    env: &mut RuntimeEnvironment,
    backtrace: &Backtrace,
) -> Result<Value, RuntimeError> {
    match term {
        Term::Datum(value) => Ok(value.clone()),
        Term::Var(name) => env
            .scopes
            .lookup(name)
            .cloned()
            .ok_or_else(|| RuntimeError::new(format!("unbound variable `{name}`"), backtrace)),
        Term::Field(of, name) => {
            let value = eval(of, env, &backtrace.frame("field"))?;
            match value {
                Value::Object(mut map) => map.remove(name).ok_or_else(|| {
                    RuntimeError::new(format!("object has no attribute `{name}`"), backtrace)
                }),
                other => Err(RuntimeError::new(
                    format!("cannot access attribute `{name}` of non-object {other}"),
                    backtrace,
                )),
            }
        }
        Term::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, env, &backtrace.frame("lhs"))?;
            let rhs = eval(rhs, env, &backtrace.frame("rhs"))?;
            match op {
                BinOp::Add => match (&lhs, &rhs) {
                    (Value::String(a), Value::String(b)) => {
                        Ok(Value::String(format!("{a}{b}")))
                    }
                    _ => {
                        let a = number(&lhs, "addition", backtrace)?;
                        let b = number(&rhs, "addition", backtrace)?;
                        from_f64(a + b, backtrace)
                    }
                },
                BinOp::Sub => {
                    let a = number(&lhs, "subtraction", backtrace)?;
                    let b = number(&rhs, "subtraction", backtrace)?;
                    from_f64(a - b, backtrace)
                }
                BinOp::Mul => {
                    let a = number(&lhs, "multiplication", backtrace)?;
                    let b = number(&rhs, "multiplication", backtrace)?;
                    from_f64(a * b, backtrace)
                }
                BinOp::Div => {
                    let a = number(&lhs, "division", backtrace)?;
                    let b = number(&rhs, "division", backtrace)?;
                    if b == 0.0 {
                        return Err(RuntimeError::new("division by zero", backtrace));
                    }
                    from_f64(a / b, backtrace)
                }
                BinOp::Eq => Ok(Value::Bool(cmp_values(&lhs, &rhs) == Ordering::Equal)),
                BinOp::Ne => Ok(Value::Bool(cmp_values(&lhs, &rhs) != Ordering::Equal)),
                BinOp::Lt => Ok(Value::Bool(cmp_values(&lhs, &rhs) == Ordering::Less)),
                BinOp::Le => Ok(Value::Bool(cmp_values(&lhs, &rhs) != Ordering::Greater)),
                BinOp::Gt => Ok(Value::Bool(cmp_values(&lhs, &rhs) == Ordering::Greater)),
                BinOp::Ge => Ok(Value::Bool(cmp_values(&lhs, &rhs) != Ordering::Less)),
            }
        }
    }
}

/// Apply a one-argument mapping to `arg` in a child scope frame.
pub fn eval_mapping(
    mapping: &Mapping,
    env: &mut RuntimeEnvironment,
    arg: Value,
    backtrace: &Backtrace,
) -> Result<Value, RuntimeError> {
    env.scopes.push_frame();
    env.scopes.put_in_scope(mapping.arg.clone(), arg);
    let result = eval(&mapping.body, env, backtrace);
    env.scopes.pop_frame();
    result
}

/// One fold step of a reduction in a child scope frame.
pub fn eval_reduction_step(
    reduction: &Reduction,
    env: &mut RuntimeEnvironment,
    acc: Value,
    next: Value,
    backtrace: &Backtrace,
) -> Result<Value, RuntimeError> {
    env.scopes.push_frame();
    env.scopes.put_in_scope(reduction.var1.clone(), acc);
    env.scopes.put_in_scope(reduction.var2.clone(), next);
    let result = eval(&reduction.body, env, backtrace);
    env.scopes.pop_frame();
    result
}
