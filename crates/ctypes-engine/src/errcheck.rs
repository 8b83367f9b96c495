//! Post-call result checking hooks
//!
//! A binding holds at most one hook. The hook sees the decoded return
//! value, the binding and the original arguments; whatever it returns
//! replaces the call result, and any error it raises reaches the caller
//! wrapped in [`FfiError::ErrCheck`] with the original error as source.

use crate::call::CallableBinding;
use crate::error::{BoxError, FfiError, FfiResult};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Errcheck hook signature
pub type ErrCheckFn =
    Arc<dyn Fn(Value, &CallableBinding, &[Value]) -> Result<Value, BoxError> + Send + Sync>;

/// Whether a binding currently has a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    NoHook,
    HookAttached,
}

/// Storage for a binding's hook
#[derive(Clone, Default)]
pub struct ErrCheckSlot {
    hook: Option<ErrCheckFn>,
}

impl ErrCheckSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `hook`, replacing any previous one
    pub fn attach(&mut self, hook: ErrCheckFn) {
        self.hook = Some(hook);
    }

    pub fn detach(&mut self) -> Option<ErrCheckFn> {
        self.hook.take()
    }

    pub fn state(&self) -> HookState {
        match self.hook {
            Some(_) => HookState::HookAttached,
            None => HookState::NoHook,
        }
    }

    pub fn current(&self) -> Option<ErrCheckFn> {
        self.hook.clone()
    }

    /// Run the hook over a call result; passes the result through when empty
    pub fn apply(&self, result: Value, binding: &CallableBinding, args: &[Value]) -> FfiResult<Value> {
        match &self.hook {
            None => Ok(result),
            Some(hook) => hook(result, binding, args).map_err(|source| FfiError::ErrCheck {
                function: binding.name().to_string(),
                source,
            }),
        }
    }
}

impl fmt::Debug for ErrCheckSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrCheckSlot").field("state", &self.state()).finish()
    }
}

/// Compose two hooks: `second` runs on the output of `first`
pub fn chain(first: ErrCheckFn, second: ErrCheckFn) -> ErrCheckFn {
    Arc::new(move |result, binding, args| {
        let checked = first(result, binding, args)?;
        second(checked, binding, args)
    })
}

/// Hook failing when an integer result is negative (POSIX `-1` convention)
pub fn fail_on_negative() -> ErrCheckFn {
    Arc::new(|result, binding, _args| match result.as_i64() {
        Some(code) if code < 0 => Err(format!("{} returned {}", binding.name(), code).into()),
        _ => Ok(result),
    })
}

/// Hook failing when a pointer or string result is NULL
pub fn fail_on_null() -> ErrCheckFn {
    Arc::new(|result, binding, _args| {
        let is_null = match &result {
            Value::Null => true,
            Value::Pointer(p) => p.is_null(),
            _ => false,
        };
        if is_null {
            Err(format!("{} returned NULL", binding.name()).into())
        } else {
            Ok(result)
        }
    })
}
