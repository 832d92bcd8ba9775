//! Typed calls from the host into a script.
//!
//! Arguments are an ordered list of tagged values, the callee runs under
//! the protected-call boundary and exactly one return value is converted to
//! the Rust type the caller asked for.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Function, HookTriggers, Lua, MultiValue, Value, Variadic, VmState};
use thiserror::Error;

use super::api::value_to_string;

/// Stack ceiling of the interpreter (`LUAI_MAXSTACK`).
pub const MAX_STACK_SLOTS: usize = 1_000_000;

/// Slots needed on top of the arguments: the callee and its result.
pub const CALL_STACK_RESERVE: usize = 2;

/// Instructions between two budget checks.
const BUDGET_CHECK_INTERVAL: u64 = 1_000;

/// Failure of a call into a script.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// No global function with that name.
    #[error("function '{0}' not found")]
    FunctionNotFound(String),

    /// The arguments do not fit on the interpreter stack.
    #[error("could not allocate {needed} stack slots to call '{function}'")]
    StackAllocationFailed { function: String, needed: usize },

    /// The script raised an error. Holds the interpreter's message as is.
    #[error("runtime error: {0}")]
    RuntimeError(String),

    /// The returned value cannot be converted to the requested type.
    #[error("unsupported result type: expected {expected}, got {found}")]
    UnsupportedResultType {
        expected: &'static str,
        found: &'static str,
    },

    /// The call ran longer than the instruction budget.
    #[error("execution budget of {limit} instructions exceeded")]
    ExecutionBudgetExceeded { limit: u64 },

    /// The target script has no interpreter.
    #[error("script '{0}' is not loaded")]
    NotLoaded(String),

    /// The interpreter failed outside the protected call.
    #[error("interpreter error: {0}")]
    Interpreter(String),
}

impl From<mlua::Error> for CallError {
    fn from(e: mlua::Error) -> Self {
        match e {
            mlua::Error::StackError => CallError::StackAllocationFailed {
                function: String::new(),
                needed: 0,
            },
            other => CallError::Interpreter(other.to_string()),
        }
    }
}

/// One argument of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Nil,
    Integer(i64),
    Boolean(bool),
    Number(f64),
    String(String),
}

impl CallArg {
    fn to_value(&self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            Self::Nil => Value::Nil,
            Self::Integer(i) => Value::Integer(*i),
            Self::Boolean(b) => Value::Boolean(*b),
            Self::Number(n) => Value::Number(*n),
            Self::String(s) => Value::String(lua.create_string(s)?),
        })
    }
}

impl From<i64> for CallArg {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for CallArg {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<bool> for CallArg {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<f64> for CallArg {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for CallArg {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for CallArg {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Ordered arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs(Vec<CallArg>);

impl CallArgs {
    /// Create an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument.
    pub fn arg<A: Into<CallArg>>(mut self, arg: A) -> Self {
        self.0.push(arg.into());
        self
    }

    /// Append an integer argument.
    pub fn int(self, v: i64) -> Self {
        self.arg(CallArg::Integer(v))
    }

    /// Append a boolean argument.
    pub fn boolean(self, v: bool) -> Self {
        self.arg(CallArg::Boolean(v))
    }

    /// Append a nil argument.
    pub fn nil(self) -> Self {
        self.arg(CallArg::Nil)
    }

    /// Append an argument in place.
    pub fn push<A: Into<CallArg>>(&mut self, arg: A) {
        self.0.push(arg.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallArg> {
        self.0.iter()
    }
}

impl<A: Into<CallArg>> FromIterator<A> for CallArgs {
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Dynamically typed scalar result.
#[derive(Debug, Clone, PartialEq)]
pub enum CallValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

/// Rust types a call result can be converted to.
pub trait FromCallResult: Sized {
    /// Name of the expected kind, for error messages.
    const EXPECTED: &'static str;

    /// Convert the returned value; `None` if its kind does not fit.
    fn from_value(value: Value) -> Option<Self>;
}

impl FromCallResult for () {
    const EXPECTED: &'static str = "nothing";

    fn from_value(_: Value) -> Option<Self> {
        Some(())
    }
}

/// Lua truthiness: only `nil` and `false` are false.
impl FromCallResult for bool {
    const EXPECTED: &'static str = "boolean";

    fn from_value(value: Value) -> Option<Self> {
        Some(!matches!(value, Value::Nil | Value::Boolean(false)))
    }
}

impl FromCallResult for i64 {
    const EXPECTED: &'static str = "integer";

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(i),
            Value::Number(n) => float_to_integer(n),
            Value::String(s) => {
                let text = s.to_str().ok()?;
                let text = text.trim();
                text.parse::<i64>()
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().and_then(float_to_integer))
            }
            _ => None,
        }
    }
}

impl FromCallResult for i32 {
    const EXPECTED: &'static str = "32-bit integer";

    fn from_value(value: Value) -> Option<Self> {
        i64::from_value(value).and_then(|i| i32::try_from(i).ok())
    }
}

impl FromCallResult for f64 {
    const EXPECTED: &'static str = "number";

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(i as f64),
            Value::Number(n) => Some(n),
            Value::String(s) => s.to_str().ok()?.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromCallResult for String {
    const EXPECTED: &'static str = "string";

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.to_string_lossy().to_string()),
            Value::Integer(_) | Value::Number(_) => Some(value_to_string(&value)),
            _ => None,
        }
    }
}

impl<T: FromCallResult> FromCallResult for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Nil => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromCallResult for CallValue {
    const EXPECTED: &'static str = "scalar";

    fn from_value(value: Value) -> Option<Self> {
        Some(match value {
            Value::Nil => CallValue::Nil,
            Value::Boolean(b) => CallValue::Boolean(b),
            Value::Integer(i) => CallValue::Integer(i),
            Value::Number(n) => CallValue::Number(n),
            Value::String(s) => CallValue::String(s.to_string_lossy().to_string()),
            _ => return None,
        })
    }
}

fn float_to_integer(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

/// Convert a returned value to `R`.
pub fn convert_result<R: FromCallResult>(value: Value) -> Result<R, CallError> {
    let found = value.type_name();
    R::from_value(value).ok_or(CallError::UnsupportedResultType {
        expected: R::EXPECTED,
        found,
    })
}

/// Instruction budget of a single call (0 = unlimited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionBudget {
    pub max_instructions: u64,
}

impl ExecutionBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn instructions(max_instructions: u64) -> Self {
        Self { max_instructions }
    }
}

/// Calls into one interpreter through its protected-call primitive.
pub struct Marshaller {
    pcall: Function,
    budget: ExecutionBudget,
}

impl Marshaller {
    /// Capture the interpreter's `pcall`.
    ///
    /// Must run before any script code, which could replace the global.
    pub fn new(lua: &Lua, budget: ExecutionBudget) -> mlua::Result<Self> {
        let pcall: Function = lua.globals().get("pcall")?;
        Ok(Self { pcall, budget })
    }

    /// Call the global function `name`.
    pub fn call<R: FromCallResult>(
        &self,
        lua: &Lua,
        name: &str,
        args: &CallArgs,
    ) -> Result<R, CallError> {
        let func = match lua.globals().get::<Value>(name)? {
            Value::Function(func) => func,
            _ => return Err(CallError::FunctionNotFound(name.to_string())),
        };
        self.invoke(lua, name, &func, args)
    }

    /// Call an already resolved function. `name` is only used in errors.
    pub fn invoke<R: FromCallResult>(
        &self,
        lua: &Lua,
        name: &str,
        func: &Function,
        args: &CallArgs,
    ) -> Result<R, CallError> {
        let needed = args.len() + CALL_STACK_RESERVE;
        if needed > MAX_STACK_SLOTS {
            return Err(CallError::StackAllocationFailed {
                function: name.to_string(),
                needed,
            });
        }

        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(Value::Function(func.clone()));
        for arg in args.iter() {
            values.push(arg.to_value(lua)?);
        }

        let tripped = self.arm_budget(lua);
        let outcome = self
            .pcall
            .call::<MultiValue>(values.into_iter().collect::<Variadic<Value>>());
        if let Some(flag) = tripped {
            lua.remove_hook();
            // Scripts may catch the budget error; the call fails regardless.
            if flag.load(Ordering::SeqCst) {
                return Err(CallError::ExecutionBudgetExceeded {
                    limit: self.budget.max_instructions,
                });
            }
        }

        let returned = outcome.map_err(|e| match e {
            mlua::Error::StackError => CallError::StackAllocationFailed {
                function: name.to_string(),
                needed,
            },
            other => CallError::Interpreter(other.to_string()),
        })?;

        let mut returned = returned.into_iter();
        let succeeded = matches!(returned.next(), Some(Value::Boolean(true)));
        let value = returned.next().unwrap_or(Value::Nil);

        if !succeeded {
            return Err(CallError::RuntimeError(error_text(&value)));
        }

        convert_result(value)
    }

    /// Install the instruction hook for one call.
    fn arm_budget(&self, lua: &Lua) -> Option<Arc<AtomicBool>> {
        let limit = self.budget.max_instructions;
        if limit == 0 {
            return None;
        }

        let step = BUDGET_CHECK_INTERVAL.min(limit);
        let executed = Arc::new(AtomicU64::new(0));
        let tripped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&tripped);

        lua.set_hook(
            HookTriggers::new().every_nth_instruction(step as u32),
            move |lua, _debug| {
                let current = executed.fetch_add(step, Ordering::SeqCst) + step;
                if current <= limit {
                    return Ok(VmState::Continue);
                }

                flag.store(true, Ordering::SeqCst);
                // Fail every following instruction so a protected call inside
                // the script cannot swallow the error and keep running.
                lua.set_hook(
                    HookTriggers::new().every_nth_instruction(1),
                    move |_lua, _debug| Err(budget_error(limit)),
                );
                Err(budget_error(limit))
            },
        );

        Some(tripped)
    }
}

fn budget_error(limit: u64) -> mlua::Error {
    mlua::Error::RuntimeError(format!(
        "execution budget of {} instructions exceeded",
        limit
    ))
}

/// Text of an error value raised inside a protected call.
fn error_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Error(e) => e.to_string(),
        other => value_to_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_with(source: &str) -> (Lua, Marshaller) {
        let lua = Lua::new();
        let marshaller = Marshaller::new(&lua, ExecutionBudget::unlimited()).unwrap();
        lua.load(source).exec().unwrap();
        (lua, marshaller)
    }

    #[test]
    fn test_add_integers() {
        let (lua, m) = lua_with("function add(a, b) return a + b end");
        let args = CallArgs::new().int(2).int(3);
        let result: i64 = m.call(&lua, "add", &args).unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn test_arguments_keep_order() {
        let (lua, m) = lua_with("function sub(a, b) return a - b end");
        let result: i64 = m.call(&lua, "sub", &CallArgs::new().int(10).int(4)).unwrap();
        assert_eq!(result, 6);
    }

    #[test]
    fn test_function_not_found() {
        let (lua, m) = lua_with("");
        let result = m.call::<i64>(&lua, "missing", &CallArgs::new());
        assert_eq!(result, Err(CallError::FunctionNotFound("missing".to_string())));
    }

    #[test]
    fn test_non_function_global_is_not_found() {
        let (lua, m) = lua_with("notafunction = 42");
        let result = m.call::<i64>(&lua, "notafunction", &CallArgs::new());
        assert!(matches!(result, Err(CallError::FunctionNotFound(_))));
    }

    #[test]
    fn test_runtime_error_message_is_unmodified() {
        let (lua, m) = lua_with("function fail() error('boom', 0) end");
        let result = m.call::<()>(&lua, "fail", &CallArgs::new());
        assert_eq!(result, Err(CallError::RuntimeError("boom".to_string())));
    }

    #[test]
    fn test_runtime_error_with_position() {
        let (lua, m) = lua_with("function fail() local t = nil; return t.x end");
        match m.call::<()>(&lua, "fail", &CallArgs::new()) {
            Err(CallError::RuntimeError(message)) => {
                assert!(message.contains("attempt to index"));
                assert!(!message.contains("stack traceback"));
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_boolean_arguments() {
        let (lua, m) = lua_with("function negate(b) return not b end");
        let result: bool = m.call(&lua, "negate", &CallArgs::new().boolean(false)).unwrap();
        assert!(result);
    }

    #[test]
    fn test_string_and_number_arguments() {
        let (lua, m) = lua_with("function greet(name, n) return name .. ':' .. n end");
        let args = CallArgs::new().arg("tee").arg(1.5);
        let result: String = m.call(&lua, "greet", &args).unwrap();
        assert_eq!(result, "tee:1.5");
    }

    #[test]
    fn test_nil_argument() {
        let (lua, m) = lua_with("function isnil(v) return v == nil end");
        let result: bool = m.call(&lua, "isnil", &CallArgs::new().nil()).unwrap();
        assert!(result);
    }

    #[test]
    fn test_only_first_result_is_kept() {
        let (lua, m) = lua_with("function pair() return 1, 2 end");
        let result: i64 = m.call(&lua, "pair", &CallArgs::new()).unwrap();
        assert_eq!(result, 1);
    }

    #[test]
    fn test_unsupported_result_type() {
        let (lua, m) = lua_with("function tbl() return {} end");
        let result = m.call::<i64>(&lua, "tbl", &CallArgs::new());
        assert_eq!(
            result,
            Err(CallError::UnsupportedResultType {
                expected: "integer",
                found: "table"
            })
        );
    }

    #[test]
    fn test_bool_uses_truthiness() {
        let (lua, m) = lua_with(
            "function none() end
             function zero() return 0 end
             function no() return false end",
        );
        assert!(!m.call::<bool>(&lua, "none", &CallArgs::new()).unwrap());
        assert!(m.call::<bool>(&lua, "zero", &CallArgs::new()).unwrap());
        assert!(!m.call::<bool>(&lua, "no", &CallArgs::new()).unwrap());
    }

    #[test]
    fn test_integer_conversions() {
        let (lua, m) = lua_with(
            "function whole() return 4.0 end
             function frac() return 4.5 end
             function text() return ' 12 ' end",
        );
        assert_eq!(m.call::<i64>(&lua, "whole", &CallArgs::new()).unwrap(), 4);
        assert!(m.call::<i64>(&lua, "frac", &CallArgs::new()).is_err());
        assert_eq!(m.call::<i64>(&lua, "text", &CallArgs::new()).unwrap(), 12);
    }

    #[test]
    fn test_i32_out_of_range() {
        let (lua, m) = lua_with("function big() return 1 << 40 end");
        let result = m.call::<i32>(&lua, "big", &CallArgs::new());
        assert!(matches!(result, Err(CallError::UnsupportedResultType { .. })));
    }

    #[test]
    fn test_optional_result() {
        let (lua, m) = lua_with("function none() return nil end function one() return 1 end");
        assert_eq!(m.call::<Option<i64>>(&lua, "none", &CallArgs::new()).unwrap(), None);
        assert_eq!(m.call::<Option<i64>>(&lua, "one", &CallArgs::new()).unwrap(), Some(1));
    }

    #[test]
    fn test_dynamic_result() {
        let (lua, m) = lua_with("function s() return 'x' end function f() return print end");
        assert_eq!(
            m.call::<CallValue>(&lua, "s", &CallArgs::new()).unwrap(),
            CallValue::String("x".to_string())
        );
        assert!(m.call::<CallValue>(&lua, "f", &CallArgs::new()).is_err());
    }

    #[test]
    fn test_captured_pcall_survives_override() {
        let (lua, m) = lua_with(
            "pcall = function() return true, 99 end
             function seven() return 7 end",
        );
        assert_eq!(m.call::<i64>(&lua, "seven", &CallArgs::new()).unwrap(), 7);
    }

    #[test]
    fn test_execution_budget_exceeded() {
        let lua = Lua::new();
        let m = Marshaller::new(&lua, ExecutionBudget::instructions(10_000)).unwrap();
        lua.load("function spin() while true do end end").exec().unwrap();

        let result = m.call::<()>(&lua, "spin", &CallArgs::new());
        assert_eq!(
            result,
            Err(CallError::ExecutionBudgetExceeded { limit: 10_000 })
        );

        // The hook is removed after the call.
        lua.load("for i = 1, 100000 do end").exec().unwrap();
    }

    #[test]
    fn test_caught_budget_error_still_fails() {
        let lua = Lua::new();
        let m = Marshaller::new(&lua, ExecutionBudget::instructions(10_000)).unwrap();
        lua.load(
            r#"
            function swallow() local ok = pcall(function() while true do end end) return 1 end
            function nested() while true do pcall(function() while true do end end) end end
            function rethrow() pcall(function() while true do end end) error("mine", 0) end
            "#,
        )
        .exec()
        .unwrap();

        for name in ["swallow", "nested", "rethrow"] {
            assert_eq!(
                m.call::<i64>(&lua, name, &CallArgs::new()),
                Err(CallError::ExecutionBudgetExceeded { limit: 10_000 }),
                "{name}"
            );
        }

        // The next call gets a fresh budget.
        lua.load("function quick() return 3 end").exec().unwrap();
        assert_eq!(m.call::<i64>(&lua, "quick", &CallArgs::new()).unwrap(), 3);
    }

    #[test]
    fn test_budget_allows_short_calls() {
        let lua = Lua::new();
        let m = Marshaller::new(&lua, ExecutionBudget::instructions(100_000)).unwrap();
        lua.load("function add(a, b) return a + b end").exec().unwrap();

        let result: i64 = m.call(&lua, "add", &CallArgs::new().int(1).int(1)).unwrap();
        assert_eq!(result, 2);
    }

    #[test]
    fn test_call_args_builders() {
        let args: CallArgs = vec![1i64, 2, 3].into_iter().collect();
        assert_eq!(args.len(), 3);

        let mut args = CallArgs::new();
        assert!(args.is_empty());
        args.push("name");
        args.push(true);
        assert_eq!(
            args.iter().cloned().collect::<Vec<_>>(),
            vec![CallArg::String("name".to_string()), CallArg::Boolean(true)]
        );
    }
}
