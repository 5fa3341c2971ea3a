//! # Overload Resolution
//!
//! Picks the signature a call will use before anything is batched. Arguments
//! are either handles (typed) or raw values (typed by inference). Each
//! candidate is checked in declared order; the first one whose arity and
//! argument coercions all succeed wins.
//!
//! ## Coercion rules
//!
//! | from           | to             | rule                                              |
//! |----------------|----------------|---------------------------------------------------|
//! | T              | T              | always                                            |
//! | pointer        | pointer        | null value, or base coerces, or target is `void*` |
//! | int            | int            | never narrows; same-size signed to unsigned needs a non-negative known value |
//! | float          | float          | never narrows                                     |
//! | int            | float          | not `>=4` bytes into float32, not 8 bytes into float64 |
//! | float          | int            | never                                             |
//! | String         | `char*`        | always                                            |

use std::fmt;

use neotype::Builtins;
use neotype::FunctionSignature;
use neotype::OverloadSet;
use neotype::Type;
use neotype::TypeRef;
use neowire::Value;

use crate::handles::Handle;

/// One argument of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Handle(Handle),
    Value(Value),
}

impl Arg {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Handle(_) => None,
        }
    }
}

impl From<Handle> for Arg {
    fn from(h: Handle) -> Self { Self::Handle(h) }
}

impl From<&Handle> for Arg {
    fn from(h: &Handle) -> Self { Self::Handle(h.clone()) }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self { Self::Value(v) }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self { Self::Value(v.into()) }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self { Self::Value(v.into()) }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self { Self::Value(v.into()) }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self { Self::Value(v.into()) }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self { Self::Value(v.into()) }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self { Self::Value(v.into()) }
}

impl From<String> for Arg {
    fn from(v: String) -> Self { Self::Value(v.into()) }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(h) => write!(f, "{}", h),
            Self::Value(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoercionError {
    Incompatible { from: String, to: String, value: Option<String> },
    /// Pointer conversions only go to `void*` unless the bases coerce.
    PointerTarget { to: String },
    TooLarge { from: String, to: String },
    /// A negative value into an unsigned type of the same size.
    Negative { from: String, to: String, value: String },
    FloatToInt { from: String, to: String },
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible { from, to, value: Some(v) } => {
                write!(f, "Can't coerce {} to {} (with value = {})", from, to, v)
            }
            Self::Incompatible { from, to, value: None } => write!(f, "Can't coerce {} to {}", from, to),
            Self::PointerTarget { to } => write!(f, "Can only coerce to void*, not {}", to),
            Self::TooLarge { from, to } => write!(f, "Argument type is too large: {} > {}", from, to),
            Self::Negative { from, to, value } => {
                write!(f, "Can't coerce negative value {} from {} to {}", value, from, to)
            }
            Self::FloatToInt { from, to } => write!(f, "Can't coerce float {} to int {}", from, to),
        }
    }
}

impl std::error::Error for CoercionError {}

/// Why one candidate signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateError {
    Arity { expected: usize, found: usize, variadic: bool },
    Argument { index: usize, error: CoercionError },
}

impl fmt::Display for CandidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arity { expected, found, variadic: true } => {
                write!(f, "Expected at least {} args, got {}", expected, found)
            }
            Self::Arity { expected, found, variadic: false } => {
                write!(f, "Expected {} args, got {}", expected, found)
            }
            Self::Argument { index, error } => write!(f, "Arg #{}: {}", index, error),
        }
    }
}

impl std::error::Error for CandidateError {}

/// No candidate accepted the arguments. Lists every candidate with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverloadError {
    pub name: String,
    pub args: Vec<String>,
    pub candidates: Vec<(String, CandidateError)>,
}

impl fmt::Display for OverloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "No overload found for call \"{}({})\".", self.name, self.args.join(", "))?;
        write!(f, "Possibilities:")?;
        for (signature, reason) in &self.candidates {
            write!(f, "\n{}\n  {}", signature, reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for OverloadError {}

/// Type inference and coercion against one set of builtin types.
#[derive(Debug, Clone)]
pub struct Resolver {
    builtins: Builtins,
}

impl Resolver {
    pub fn new(builtins: Builtins) -> Self {
        Self { builtins }
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// The type an argument is checked as.
    pub fn infer(&self, arg: &Arg) -> TypeRef {
        match arg {
            Arg::Handle(h) => h.ty().clone(),
            Arg::Value(v) => self.infer_value(v),
        }
    }

    pub fn infer_value(&self, value: &Value) -> TypeRef {
        let b = &self.builtins;
        match value {
            Value::Null => b.void_ptr.clone(),
            Value::Int(v) => self.int_type(*v),
            Value::UInt(_) => b.uint64.clone(),
            Value::Float(v) if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 => {
                self.int_type(*v as i64)
            }
            Value::Float(v) if v.fract() == 0.0 && *v >= 0.0 && *v < u64::MAX as f64 => b.uint64.clone(),
            Value::Float(_) => b.float64.clone(),
            Value::Str(_) => b.string.clone(),
            Value::Bytes(_) => b.array_buffer.clone(),
            Value::Array(_) => b.array.clone(),
            Value::Dict(_) => b.dictionary.clone(),
        }
    }

    /// The smallest signed integer type that holds `v`.
    fn int_type(&self, v: i64) -> TypeRef {
        let b = &self.builtins;
        if i8::try_from(v).is_ok() {
            b.int8.clone()
        } else if i16::try_from(v).is_ok() {
            b.int16.clone()
        } else if i32::try_from(v).is_ok() {
            b.int32.clone()
        } else {
            b.int64.clone()
        }
    }

    /// Whether a value of type `from` may be passed where `to` is expected.
    /// `value` is the literal being passed, when there is one.
    pub fn can_coerce(&self, from: &Type, to: &Type, value: Option<&Value>) -> Result<(), CoercionError> {
        if from == to {
            return Ok(());
        }
        if from.is_pointer() && to.is_pointer() {
            return self.coerce_pointer(from, to, value);
        }
        if from.is_primitive() && to.is_primitive() {
            return coerce_primitive(from, to, value);
        }
        if from.host_class() == Some(neotype::HostClass::String) && to == self.builtins.char_ptr.as_ref() {
            return Ok(());
        }
        Err(CoercionError::Incompatible {
            from: from.to_string(),
            to: to.to_string(),
            value: value.map(Value::to_string),
        })
    }

    fn coerce_pointer(&self, from: &Type, to: &Type, value: Option<&Value>) -> Result<(), CoercionError> {
        if value.is_some_and(Value::is_null) {
            return Ok(());
        }
        if let (Some(from_base), Some(to_base)) = (from.pointee(), to.pointee()) {
            if self.can_coerce(from_base, to_base, None).is_ok() {
                return Ok(());
            }
        }
        if to == self.builtins.void_ptr.as_ref() {
            return Ok(());
        }
        Err(CoercionError::PointerTarget { to: to.to_string() })
    }

    /// Checks one candidate against the call's arguments.
    pub fn check(&self, sig: &FunctionSignature, args: &[Arg]) -> Result<(), CandidateError> {
        let arity_ok = if sig.variadic { args.len() >= sig.args.len() } else { args.len() == sig.args.len() };
        if !arity_ok {
            return Err(CandidateError::Arity {
                expected: sig.args.len(),
                found: args.len(),
                variadic: sig.variadic,
            });
        }
        for (index, (param, arg)) in sig.args.iter().zip(args).enumerate() {
            let from = self.infer(arg);
            self.can_coerce(&from, param, arg.value())
                .map_err(|error| CandidateError::Argument { index, error })?;
        }
        Ok(())
    }

    /// The first signature in `set` that accepts `args`.
    pub fn resolve<'a>(&self, set: &'a OverloadSet, args: &[Arg]) -> Result<&'a FunctionSignature, OverloadError> {
        let mut candidates = Vec::with_capacity(set.signatures.len());
        for sig in &set.signatures {
            match self.check(sig, args) {
                Ok(()) => return Ok(sig),
                Err(reason) => candidates.push((sig.to_string(), reason)),
            }
        }
        Err(OverloadError {
            name: set.name.clone(),
            args: args.iter().map(Arg::to_string).collect(),
            candidates,
        })
    }
}

fn coerce_primitive(from: &Type, to: &Type, value: Option<&Value>) -> Result<(), CoercionError> {
    let (Some(f), Some(t)) = (from.as_primitive(), to.as_primitive()) else {
        return Err(CoercionError::Incompatible { from: from.to_string(), to: to.to_string(), value: None });
    };
    let too_large = || CoercionError::TooLarge { from: from.to_string(), to: to.to_string() };

    match (f.is_int, t.is_int) {
        (true, true) => {
            if f.size > t.size {
                return Err(too_large());
            }
            if f.size == t.size && f.signed && !t.signed && value.is_some_and(Value::is_negative) {
                return Err(CoercionError::Negative {
                    from: from.to_string(),
                    to: to.to_string(),
                    value: value.map(Value::to_string).unwrap_or_default(),
                });
            }
            // Same-size unsigned to signed is accepted.
            Ok(())
        }
        (false, false) if f.size > t.size => Err(too_large()),
        (false, false) => Ok(()),
        (true, false) => {
            // Follows the peer's table, which is stricter than "anything up to
            // 4 bytes reaches either float": a 4-byte int cannot become a float.
            if (t.size == 4 && f.size >= 4) || (t.size == 8 && f.size == 8) {
                Err(too_large())
            } else {
                Ok(())
            }
        }
        (false, true) => Err(CoercionError::FloatToInt { from: from.to_string(), to: to.to_string() }),
    }
}
