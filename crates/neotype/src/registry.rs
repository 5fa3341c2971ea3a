//! # Type Registry
//!
//! The registry is the source of truth for every type and function the peer
//! understands. It is built once, normally from a generated table, and is
//! read-only afterwards.
//!
//! ## Philosophy
//!
//! - **Dense, collision-free ids**: registering a duplicate id, name, or
//!   structurally-equal descriptor is a bug in the table, not a runtime
//!   condition. The `register_*` family panics; `try_register` reports.
//! - **Structural lookup**: `find_structural` scans linearly. Tables are small.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::descriptor::Field;
use crate::descriptor::FunctionType;
use crate::descriptor::HostClass;
use crate::descriptor::Opaque;
use crate::descriptor::Primitive;
use crate::descriptor::StructType;
use crate::descriptor::Type;
use crate::descriptor::TypeDescriptor;
use crate::descriptor::TypeId;
use crate::descriptor::TypeRef;
use crate::descriptor::UNREGISTERED;

/// Registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Id 0 marks unregistered descriptors and cannot be taken.
    ReservedId { name: String },
    DuplicateId { id: TypeId, name: String, existing: String },
    DuplicateName { name: String },
    /// A structurally-equal descriptor is already registered.
    DuplicateType { name: String, existing_id: TypeId, existing_name: String },
    FieldOutOfBounds { name: String, field: String, end: u64, size: u32 },
    DuplicateField { name: String, field: String },
    DuplicateFunction { name: String },
    EmptyOverloadSet { name: String },
    NotAFunction { name: String, ty: String },
    UnknownType { name: String },
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedId { name } => write!(f, "type '{}' cannot use reserved id 0", name),
            Self::DuplicateId { id, name, existing } => write!(f, "id {} for '{}' already taken by '{}'", id, name, existing),
            Self::DuplicateName { name } => write!(f, "name '{}' already exists", name),
            Self::DuplicateType { name, existing_id, existing_name } => write!(f, "type '{}' already exists. id = {} name = {}", name, existing_id, existing_name),
            Self::FieldOutOfBounds { name, field, end, size } => write!(f, "field '{}' of struct {} ends at {} past size {}", field, name, end, size),
            Self::DuplicateField { name, field } => write!(f, "field '{}' of struct {} already exists", field, name),
            Self::DuplicateFunction { name } => write!(f, "function '{}' already exists", name),
            Self::EmptyOverloadSet { name } => write!(f, "function '{}' has no overloads", name),
            Self::NotAFunction { name, ty } => write!(f, "overload of '{}' is not a function type: {}", name, ty),
            Self::UnknownType { name } => write!(f, "type '{}' is not registered", name),
        }
    }
}

impl std::error::Error for RegistrationError {}

pub type Result<T> = std::result::Result<T, RegistrationError>;

fn fatal<T>(result: Result<T>) -> T {
    result.unwrap_or_else(|e| panic!("Assertion failed: {}", e))
}

/// One callable shape of a named function.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    /// Id of the function type; sent on the wire as the signature id.
    pub id: TypeId,
    pub ret: TypeRef,
    pub args: Vec<TypeRef>,
    pub variadic: bool,
}

impl FunctionSignature {
    pub fn returns_void(&self) -> bool {
        self.ret.is_void()
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.ret, self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        if self.variadic {
            write!(f, "{}...", if self.args.is_empty() { "" } else { ", " })?;
        }
        write!(f, ")")
    }
}

/// All signatures sharing one function name, in declared order.
#[derive(Debug, Clone)]
pub struct OverloadSet {
    pub name: String,
    pub signatures: Vec<FunctionSignature>,
}

impl OverloadSet {
    /// The first signature whose leading parameter is structurally equal to `ty`.
    pub fn by_first_param(&self, ty: &Type) -> Option<&FunctionSignature> {
        self.signatures
            .iter()
            .find(|sig| sig.args.first().is_some_and(|param| param.as_ref() == ty))
    }
}

#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_id: BTreeMap<TypeId, TypeRef>,
    by_name: HashMap<String, TypeRef>,
    functions: BTreeMap<String, OverloadSet>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor under a fresh id and name.
    pub fn try_register(&mut self, id: TypeId, name: &str, desc: TypeDescriptor) -> Result<TypeRef> {
        if id == UNREGISTERED {
            return Err(RegistrationError::ReservedId { name: name.into() });
        }
        if let Some(existing) = self.by_id.get(&id) {
            return Err(RegistrationError::DuplicateId {
                id,
                name: name.into(),
                existing: existing.name().into(),
            });
        }
        if self.by_name.contains_key(name) {
            return Err(RegistrationError::DuplicateName { name: name.into() });
        }
        if let Some(existing) = self.find_structural(&desc) {
            return Err(RegistrationError::DuplicateType {
                name: name.into(),
                existing_id: existing.id(),
                existing_name: existing.name().into(),
            });
        }
        if let TypeDescriptor::Struct(s) = &desc {
            validate_fields(s)?;
        }

        let ty = Arc::new(Type::new(id, name, desc));
        self.by_id.insert(id, ty.clone());
        self.by_name.insert(name.into(), ty.clone());
        Ok(ty)
    }

    /// Adds a second name for `target`. The alias shares the target's id.
    pub fn try_register_alias(&mut self, name: &str, target: &TypeRef) -> Result<TypeRef> {
        if self.by_name.contains_key(name) {
            return Err(RegistrationError::DuplicateName { name: name.into() });
        }
        if !target.is_registered() {
            return Err(RegistrationError::UnknownType { name: target.to_string() });
        }
        let ty = Arc::new(Type::new(target.id(), name, TypeDescriptor::Alias(target.clone())));
        self.by_name.insert(name.into(), ty.clone());
        Ok(ty)
    }

    /// Defines a named function from one or more registered function types.
    pub fn try_register_function(&mut self, name: &str, overloads: &[TypeRef]) -> Result<&OverloadSet> {
        if self.functions.contains_key(name) {
            return Err(RegistrationError::DuplicateFunction { name: name.into() });
        }
        if overloads.is_empty() {
            return Err(RegistrationError::EmptyOverloadSet { name: name.into() });
        }

        let signatures = overloads
            .iter()
            .map(|ty| {
                let func = ty.as_function().ok_or_else(|| RegistrationError::NotAFunction {
                    name: name.into(),
                    ty: ty.to_string(),
                })?;
                Ok(FunctionSignature {
                    name: name.into(),
                    id: ty.id(),
                    ret: func.ret.clone(),
                    args: func.args.clone(),
                    variadic: func.variadic,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let set = OverloadSet { name: name.into(), signatures };
        Ok(self.functions.entry(name.into()).or_insert(set))
    }

    pub fn register_void(&mut self, id: TypeId, name: &str) -> TypeRef {
        fatal(self.try_register(id, name, TypeDescriptor::Void))
    }

    pub fn register_primitive(&mut self, id: TypeId, name: &str, size: u32, signed: bool, is_int: bool) -> TypeRef {
        let prim = Primitive { name: name.into(), size, signed, is_int };
        fatal(self.try_register(id, name, TypeDescriptor::Primitive(prim)))
    }

    pub fn register_pointer(&mut self, id: TypeId, name: &str, base: &TypeRef) -> TypeRef {
        fatal(self.try_register(id, name, TypeDescriptor::Pointer(base.clone())))
    }

    pub fn register_struct(&mut self, id: TypeId, name: &str, size: u32, fields: Vec<Field>) -> TypeRef {
        let s = StructType { name: name.into(), size, fields };
        fatal(self.try_register(id, name, TypeDescriptor::Struct(s)))
    }

    /// Function types are named after their id; they are looked up by structure.
    pub fn register_function_type(&mut self, id: TypeId, ret: &TypeRef, args: &[TypeRef], variadic: bool) -> TypeRef {
        let func = FunctionType { ret: ret.clone(), args: args.to_vec(), variadic };
        let name = format!("__FunctionType{}", id);
        fatal(self.try_register(id, &name, TypeDescriptor::Function(func)))
    }

    pub fn register_opaque(&mut self, id: TypeId, name: &str, host: HostClass) -> TypeRef {
        let opaque = Opaque { name: name.into(), host };
        fatal(self.try_register(id, name, TypeDescriptor::Opaque(opaque)))
    }

    pub fn register_alias(&mut self, name: &str, target: &TypeRef) -> TypeRef {
        fatal(self.try_register_alias(name, target))
    }

    pub fn register_function(&mut self, name: &str, overloads: &[TypeRef]) -> &OverloadSet {
        fatal(self.try_register_function(name, overloads))
    }

    /// Finds the registered type structurally equal to `desc`.
    pub fn find_structural(&self, desc: &TypeDescriptor) -> Option<TypeRef> {
        self.by_id.values().find(|ty| ty.descriptor() == desc).cloned()
    }

    /// Returns the registered `base*`, or an unregistered descriptor usable only
    /// for local type-checking.
    pub fn pointer_to(&self, base: &TypeRef) -> TypeRef {
        let desc = TypeDescriptor::Pointer(base.clone());
        self.find_structural(&desc).unwrap_or_else(|| Type::unregistered(desc))
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeRef> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&TypeRef> {
        self.by_name.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&OverloadSet> {
        self.functions.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &OverloadSet> {
        self.functions.values()
    }

    /// Number of registered ids. Aliases are not counted.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn validate_fields(s: &StructType) -> Result<()> {
    for (i, field) in s.fields.iter().enumerate() {
        // Widened so offsets near u32::MAX cannot wrap.
        let end = u64::from(field.offset) + u64::from(field.ty.sizeof());
        if end > u64::from(s.size) {
            return Err(RegistrationError::FieldOutOfBounds {
                name: s.name.clone(),
                field: field.name.clone(),
                end,
                size: s.size,
            });
        }
        if s.fields[..i].iter().any(|f| f.name == field.name) {
            return Err(RegistrationError::DuplicateField {
                name: s.name.clone(),
                field: field.name.clone(),
            });
        }
    }
    Ok(())
}
