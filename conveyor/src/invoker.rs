//! Typed invocation over type-erased argument lists.
//!
//! The transport layer only knows ordered sequences of opaque values; the
//! invoker is the seam where concrete parameter and return types are
//! recovered. Instead of runtime reflection, each registered function is
//! wrapped at registration time into a [`TaskFn`]: a pair of type-erased
//! closures around the monomorphic `Fn`, one for the call path and one
//! for coercing return values back into their declared positions.
//!
//! Functions of zero to four arguments convert via [`IntoTaskFn`], with
//! arguments implementing `DeserializeOwned` and returns expressed as a
//! tuple implementing [`ReturnTuple`] (use `(T,)` for a single value).
//!
//! # Example
//!
//! ```ignore
//! use conveyor::invoker::TaskFn;
//!
//! let func = TaskFn::from_handler(|n: i64, name: String| -> (String, i64) {
//!     (format!("{}_'s message", name), n + 1)
//! });
//! ```

use crate::task::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while adapting a generic value list to a concrete
/// function signature.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The value list length does not match the declared positions.
    #[error("arity mismatch: expected {expected} values, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// A value could not be coerced to its declared type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

type ErasedFn = dyn Fn(Vec<Value>) -> Result<Vec<Value>, InvokeError> + Send + Sync;

/// A registered function, type-erased for transport.
///
/// Holds the call closure (decode arguments, invoke, encode returns) and
/// the return-coercion closure (re-type a decoded return list). Cloning
/// is cheap; both closures are shared.
#[derive(Clone)]
pub struct TaskFn {
    arity: usize,
    call: Arc<ErasedFn>,
    fix: Arc<ErasedFn>,
}

impl TaskFn {
    /// Wraps pre-erased call and return-coercion closures.
    ///
    /// Most callers want [`TaskFn::from_handler`] instead; this
    /// constructor is the escape hatch for hand-written adapters.
    pub fn new(
        arity: usize,
        call: impl Fn(Vec<Value>) -> Result<Vec<Value>, InvokeError> + Send + Sync + 'static,
        fix: impl Fn(Vec<Value>) -> Result<Vec<Value>, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            arity,
            call: Arc::new(call),
            fix: Arc::new(fix),
        }
    }

    /// Erases a typed function into a `TaskFn`.
    pub fn from_handler<F, Args, R>(f: F) -> Self
    where
        F: IntoTaskFn<Args, R>,
    {
        f.into_task_fn()
    }

    /// The number of argument positions the function declares.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Invokes the wrapped function with a decoded argument list.
    pub fn invoke(&self, args: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
        (self.call)(args)
    }

    /// Coerces a decoded return list to the declared return positions.
    pub fn coerce_returns(&self, returns: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
        (self.fix)(returns)
    }
}

impl std::fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFn").field("arity", &self.arity).finish()
    }
}

/// Adapts a generic argument list to a specific function signature.
///
/// The default implementation dispatches through the [`TaskFn`] closures;
/// custom invokers may wrap these calls to add instrumentation or replace
/// the coercion rules entirely.
pub trait Invoker: Send + Sync {
    /// Coerces each argument to its parameter position, invokes the
    /// function, and collects the return values.
    fn call(&self, func: &TaskFn, args: Vec<Value>) -> Result<Vec<Value>, InvokeError>;

    /// Coerces each element of a return list to its declared position's
    /// type, normalizing representations along the way.
    fn fix_returns(&self, func: &TaskFn, returns: Vec<Value>) -> Result<Vec<Value>, InvokeError>;
}

/// The built-in invoker: dispatches through the closures generated at
/// registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInvoker;

impl Invoker for DefaultInvoker {
    fn call(&self, func: &TaskFn, args: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
        func.invoke(args)
    }

    fn fix_returns(&self, func: &TaskFn, returns: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
        func.coerce_returns(returns)
    }
}

/// Conversion from a typed function into a [`TaskFn`].
///
/// Implemented for `Fn` items and closures of zero to four arguments.
/// `Args` and `Ret` are inference markers only.
pub trait IntoTaskFn<Args, Ret>: Send + Sync + 'static {
    /// Performs the erasure.
    fn into_task_fn(self) -> TaskFn;
}

/// Return values of a registered function, expressed as a tuple.
///
/// `()` declares no returns; a single value is `(T,)`. Each position must
/// serialize for transport and deserialize for coercion.
pub trait ReturnTuple: Send {
    /// Serializes the tuple into an ordered value list.
    fn into_values(self) -> Result<Vec<Value>, InvokeError>;

    /// Re-types a decoded value list position by position.
    fn coerce(values: Vec<Value>) -> Result<Vec<Value>, InvokeError>;
}

fn from_json<T: DeserializeOwned>(value: Value) -> Result<T, InvokeError> {
    serde_json::from_value(value).map_err(|e| InvokeError::TypeMismatch(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, InvokeError> {
    serde_json::to_value(value).map_err(|e| InvokeError::TypeMismatch(e.to_string()))
}

impl ReturnTuple for () {
    fn into_values(self) -> Result<Vec<Value>, InvokeError> {
        Ok(Vec::new())
    }

    fn coerce(values: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
        if values.is_empty() {
            Ok(values)
        } else {
            Err(InvokeError::ArityMismatch {
                expected: 0,
                got: values.len(),
            })
        }
    }
}

macro_rules! impl_return_tuple {
    ($count:expr, $($T:ident : $idx:tt),+) => {
        impl<$($T,)+> ReturnTuple for ($($T,)+)
        where
            $($T: Serialize + DeserializeOwned + Send,)+
        {
            fn into_values(self) -> Result<Vec<Value>, InvokeError> {
                Ok(vec![$(to_json(&self.$idx)?,)+])
            }

            #[allow(non_snake_case)]
            fn coerce(values: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
                if values.len() != $count {
                    return Err(InvokeError::ArityMismatch {
                        expected: $count,
                        got: values.len(),
                    });
                }
                let mut iter = values.into_iter();
                let mut out = Vec::with_capacity($count);
                $(
                    let $T: $T = match iter.next() {
                        Some(v) => from_json(v)?,
                        None => {
                            return Err(InvokeError::ArityMismatch {
                                expected: $count,
                                got: out.len(),
                            })
                        }
                    };
                    out.push(to_json(&$T)?);
                )+
                Ok(out)
            }
        }
    };
}

impl_return_tuple!(1, T0:0);
impl_return_tuple!(2, T0:0, T1:1);
impl_return_tuple!(3, T0:0, T1:1, T2:2);

macro_rules! impl_into_task_fn {
    ($count:expr $(, $A:ident)*) => {
        impl<F, $($A,)* R> IntoTaskFn<($($A,)*), R> for F
        where
            F: Fn($($A),*) -> R + Send + Sync + 'static,
            $($A: DeserializeOwned + Send + 'static,)*
            R: ReturnTuple + 'static,
        {
            #[allow(non_snake_case)]
            fn into_task_fn(self) -> TaskFn {
                let call = move |args: Vec<Value>| -> Result<Vec<Value>, InvokeError> {
                    if args.len() != $count {
                        return Err(InvokeError::ArityMismatch {
                            expected: $count,
                            got: args.len(),
                        });
                    }
                    #[allow(unused_mut, unused_variables)]
                    let mut iter = args.into_iter();
                    $(
                        let $A: $A = match iter.next() {
                            Some(v) => from_json(v)?,
                            None => {
                                return Err(InvokeError::ArityMismatch {
                                    expected: $count,
                                    got: 0,
                                })
                            }
                        };
                    )*
                    (self)($($A),*).into_values()
                };
                TaskFn::new($count, call, R::coerce)
            }
        }
    };
}

impl_into_task_fn!(0);
impl_into_task_fn!(1, A0);
impl_into_task_fn!(2, A0, A1);
impl_into_task_fn!(3, A0, A1, A2);
impl_into_task_fn!(4, A0, A1, A2, A3);
