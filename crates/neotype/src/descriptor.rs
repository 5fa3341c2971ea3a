//! # Type Descriptors
//!
//! Immutable values describing the peer's C-like type system.
//!
//! ## Invariants
//!
//! - Equality is structural and looks through aliases: two `Pointer`s are
//!   equal iff their base types are equal, never by identity.
//! - A `Type` with id `UNREGISTERED` may be used for local type-checking but
//!   must never be put on the wire.

use std::fmt;
use std::sync::Arc;

/// Integer id of a registered type, as carried on the wire.
pub type TypeId = u32;

/// Id carried by descriptors that were never registered.
pub const UNREGISTERED: TypeId = 0;

/// Peer pointers are always 32-bit.
pub const POINTER_SIZE: u32 = 4;

/// Size of a function pointer on the peer.
pub const FUNCTION_SIZE: u32 = 4;

/// Size of the peer's generic host value slot.
pub const HOST_VALUE_SIZE: u32 = 20;

pub type TypeRef = Arc<Type>;

/// A descriptor plus the id and display name it was registered under.
#[derive(Debug)]
pub struct Type {
    id: TypeId,
    name: String,
    desc: TypeDescriptor,
}

impl Type {
    pub fn new(id: TypeId, name: impl Into<String>, desc: TypeDescriptor) -> Self {
        Self { id, name: name.into(), desc }
    }

    /// Wraps a descriptor that has no registry entry.
    pub fn unregistered(desc: TypeDescriptor) -> TypeRef {
        Arc::new(Self::new(UNREGISTERED, "", desc))
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_registered(&self) -> bool {
        self.id != UNREGISTERED
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.desc
    }

    /// The descriptor with every alias layer removed.
    pub fn resolved(&self) -> &TypeDescriptor {
        self.desc.resolve()
    }

    pub fn sizeof(&self) -> u32 {
        self.desc.sizeof()
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.desc, TypeDescriptor::Alias(_))
    }

    pub fn is_void(&self) -> bool {
        matches!(self.resolved(), TypeDescriptor::Void)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.resolved(), TypeDescriptor::Pointer(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.resolved(), TypeDescriptor::Primitive(_))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.resolved(), TypeDescriptor::Struct(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.resolved(), TypeDescriptor::Function(_))
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.resolved(), TypeDescriptor::Opaque(_))
    }

    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self.resolved() {
            TypeDescriptor::Primitive(p) => Some(p),
            _ => None,
        }
    }

    /// Base type of a pointer.
    pub fn pointee(&self) -> Option<&TypeRef> {
        match self.resolved() {
            TypeDescriptor::Pointer(base) => Some(base),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self.resolved() {
            TypeDescriptor::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self.resolved() {
            TypeDescriptor::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn host_class(&self) -> Option<HostClass> {
        match self.resolved() {
            TypeDescriptor::Opaque(o) => Some(o.host),
            _ => None,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.desc == other.desc
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.desc {
            TypeDescriptor::Alias(_) => write!(f, "{}", self.name),
            desc => write!(f, "{}", desc),
        }
    }
}

/// The shape of a type.
#[derive(Debug, Clone)]
pub enum TypeDescriptor {
    Void,
    Primitive(Primitive),
    Pointer(TypeRef),
    Struct(StructType),
    Function(FunctionType),
    Alias(TypeRef),
    Opaque(Opaque),
}

impl TypeDescriptor {
    pub fn resolve(&self) -> &TypeDescriptor {
        match self {
            Self::Alias(target) => target.desc.resolve(),
            desc => desc,
        }
    }

    pub fn sizeof(&self) -> u32 {
        match self {
            Self::Void => 0,
            Self::Primitive(p) => p.size,
            Self::Pointer(_) => POINTER_SIZE,
            Self::Struct(s) => s.size,
            Self::Function(_) => FUNCTION_SIZE,
            Self::Alias(target) => target.sizeof(),
            Self::Opaque(_) => HOST_VALUE_SIZE,
        }
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        match (self.resolve(), other.resolve()) {
            (Self::Void, Self::Void) => true,
            (Self::Primitive(a), Self::Primitive(b)) => a == b,
            (Self::Pointer(a), Self::Pointer(b)) => a.desc == b.desc,
            (Self::Struct(a), Self::Struct(b)) => a.name == b.name,
            (Self::Function(a), Self::Function(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a.host == b.host,
            _ => false,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::Primitive(p) => write!(f, "{}", p),
            Self::Pointer(base) => write!(f, "{}*", base),
            Self::Struct(s) => write!(f, "struct {}", s.name),
            Self::Function(func) => write!(f, "{}", func),
            Self::Alias(target) => write!(f, "{}", target),
            Self::Opaque(o) => write!(f, "{}", o.name),
        }
    }
}

/// A scalar type: an integer or a float.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Primitive {
    pub name: String,
    pub size: u32,
    pub signed: bool,
    pub is_int: bool,
}

impl Primitive {
    pub fn int(name: impl Into<String>, size: u32, signed: bool) -> Self {
        Self { name: name.into(), size, signed, is_int: true }
    }

    pub fn float(name: impl Into<String>, size: u32) -> Self {
        Self { name: name.into(), size, signed: true, is_int: false }
    }

    /// The C spelling of the builtin primitives.
    pub fn c_name(&self) -> &str {
        match self.name.as_str() {
            "char" => "char",
            "int8" => "int8_t",
            "uint8" => "uint8_t",
            "int16" => "int16_t",
            "uint16" => "uint16_t",
            "int32" => "int32_t",
            "uint32" => "uint32_t",
            "long" => "long",
            "ulong" => "unsigned long",
            "int64" => "int64_t",
            "uint64" => "uint64_t",
            "float32" => "float",
            "float64" => "double",
            other => other,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.c_name())
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeRef,
    pub offset: u32,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeRef, offset: u32) -> Self {
        Self { name: name.into(), ty, offset }
    }
}

/// A C struct. Equality is nominal: two structs are equal iff their names are.
#[derive(Debug, Clone)]
pub struct StructType {
    pub name: String,
    pub size: u32,
    pub fields: Vec<Field>,
}

impl StructType {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct FunctionType {
    pub ret: TypeRef,
    pub args: Vec<TypeRef>,
    pub variadic: bool,
}

impl PartialEq for FunctionType {
    fn eq(&self, other: &Self) -> bool {
        self.variadic == other.variadic
            && self.ret.desc == other.ret.desc
            && self.args.len() == other.args.len()
            && self.args.iter().zip(&other.args).all(|(a, b)| a.desc == b.desc)
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (*)(", self.ret)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        if self.variadic {
            if !self.args.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}

/// The host-side class an opaque value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostClass {
    String,
    ArrayBuffer,
    Array,
    Dictionary,
}

/// A value owned by the host runtime, passed to the peer as a tagged variant.
#[derive(Debug, Clone)]
pub struct Opaque {
    pub name: String,
    pub host: HostClass,
}
