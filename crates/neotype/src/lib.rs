//! # Neotype
//!
//! A model of a foreign, C-like type system: primitives, pointers, structs,
//! functions, aliases, and opaque host values. Types are registered once
//! into a `TypeRegistry`, keyed by the integer ids the peer uses on the wire.

pub mod builtin;
pub mod descriptor;
pub mod registry;

pub use builtin::Builtins;
pub use builtin::DESTROY_HANDLES;
pub use builtin::FIRST_USER_ID;
pub use builtin::install_builtin_functions;
pub use builtin::install_builtin_types;
pub use builtin::standard_registry;
pub use descriptor::Field;
pub use descriptor::FunctionType;
pub use descriptor::HostClass;
pub use descriptor::Primitive;
pub use descriptor::StructType;
pub use descriptor::Type;
pub use descriptor::TypeDescriptor;
pub use descriptor::TypeId;
pub use descriptor::TypeRef;
pub use registry::FunctionSignature;
pub use registry::OverloadSet;
pub use registry::RegistrationError;
pub use registry::TypeRegistry;
