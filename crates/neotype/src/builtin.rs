//! # Builtin Types and Functions
//!
//! Every peer understands the same base vocabulary: `void`, the C scalar
//! types, a handful of pointers, the host value classes, and a small set of
//! memory and arithmetic builtins. Ids below `FIRST_USER_ID` are reserved
//! for them.

use crate::descriptor::FunctionType;
use crate::descriptor::HostClass;
use crate::descriptor::TypeDescriptor;
use crate::descriptor::TypeId;
use crate::descriptor::TypeRef;
use crate::registry::RegistrationError;
use crate::registry::Result;
use crate::registry::TypeRegistry;

/// First id available to generated tables.
pub const FIRST_USER_ID: TypeId = 1000;

const FIRST_FUNCTION_ID: TypeId = 100;

/// Name of the release command a context sends when it frees handles.
pub const DESTROY_HANDLES: &str = "*destroyHandles";

/// `(id, name, size, signed, is_int)`
const PRIMITIVES: [(TypeId, &str, u32, bool, bool); 13] = [
    (2, "char", 1, true, true),
    (3, "int8", 1, true, true),
    (4, "uint8", 1, false, true),
    (5, "int16", 2, true, true),
    (6, "uint16", 2, false, true),
    (7, "int32", 4, true, true),
    (8, "uint32", 4, false, true),
    (9, "long", 4, true, true),
    (10, "ulong", 4, false, true),
    (11, "int64", 8, true, true),
    (12, "uint64", 8, false, true),
    (13, "float32", 4, true, false),
    (14, "float64", 8, true, false),
];

/// Handles to the builtin types of a registry.
#[derive(Debug, Clone)]
pub struct Builtins {
    pub void: TypeRef,
    pub char: TypeRef,
    pub int8: TypeRef,
    pub uint8: TypeRef,
    pub int16: TypeRef,
    pub uint16: TypeRef,
    pub int32: TypeRef,
    pub uint32: TypeRef,
    pub long: TypeRef,
    pub ulong: TypeRef,
    pub int64: TypeRef,
    pub uint64: TypeRef,
    pub float32: TypeRef,
    pub float64: TypeRef,
    pub void_ptr: TypeRef,
    pub void_ptr_ptr: TypeRef,
    pub char_ptr: TypeRef,
    pub string: TypeRef,
    pub array_buffer: TypeRef,
    pub array: TypeRef,
    pub dictionary: TypeRef,
}

impl Builtins {
    /// Looks the builtin types up by name in an already populated registry.
    pub fn from_registry(reg: &TypeRegistry) -> Result<Self> {
        let get = |name: &str| {
            reg.by_name(name)
                .cloned()
                .ok_or_else(|| RegistrationError::UnknownType { name: name.into() })
        };
        Ok(Self {
            void: get("void")?,
            char: get("char")?,
            int8: get("int8")?,
            uint8: get("uint8")?,
            int16: get("int16")?,
            uint16: get("uint16")?,
            int32: get("int32")?,
            uint32: get("uint32")?,
            long: get("long")?,
            ulong: get("ulong")?,
            int64: get("int64")?,
            uint64: get("uint64")?,
            float32: get("float32")?,
            float64: get("float64")?,
            void_ptr: get("void*")?,
            void_ptr_ptr: get("void**")?,
            char_ptr: get("char*")?,
            string: get("String")?,
            array_buffer: get("ArrayBuffer")?,
            array: get("Array")?,
            dictionary: get("Dictionary")?,
        })
    }

    /// Scalar types in the order arithmetic overloads are declared.
    pub fn arithmetic(&self) -> [&TypeRef; 13] {
        [
            &self.int32, &self.uint32, &self.long, &self.ulong,
            &self.int64, &self.uint64, &self.float32, &self.float64,
            &self.int16, &self.uint16, &self.int8, &self.uint8, &self.char,
        ]
    }
}

/// Registers the builtin types into an empty registry.
pub fn install_builtin_types(reg: &mut TypeRegistry) -> Builtins {
    let void = reg.register_void(1, "void");
    let mut next_pointer = 21;
    for (id, name, size, signed, is_int) in PRIMITIVES {
        let prim = reg.register_primitive(id, name, size, signed, is_int);
        reg.register_pointer(next_pointer, &format!("{}*", name), &prim);
        next_pointer += 1;
    }
    let void_ptr = reg.register_pointer(20, "void*", &void);
    reg.register_pointer(40, "void**", &void_ptr);

    reg.register_opaque(50, "String", HostClass::String);
    reg.register_opaque(51, "ArrayBuffer", HostClass::ArrayBuffer);
    reg.register_opaque(52, "Array", HostClass::Array);
    reg.register_opaque(53, "Dictionary", HostClass::Dictionary);

    // Every name above was just registered.
    match Builtins::from_registry(reg) {
        Ok(builtins) => builtins,
        Err(e) => panic!("Assertion failed: {}", e),
    }
}

/// Reuses a structurally-equal function type or registers the next id.
struct Interner<'a> {
    reg: &'a mut TypeRegistry,
    next_id: TypeId,
}

impl Interner<'_> {
    fn func(&mut self, ret: &TypeRef, args: &[&TypeRef]) -> TypeRef {
        let args: Vec<TypeRef> = args.iter().map(|a| (*a).clone()).collect();
        let desc = TypeDescriptor::Function(FunctionType { ret: ret.clone(), args: args.clone(), variadic: false });
        if let Some(existing) = self.reg.find_structural(&desc) {
            return existing;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.reg.register_function_type(id, ret, &args, false)
    }
}

/// Registers the peer's builtin functions. Opt-in, since a generated table
/// may define its own functions with the same names.
pub fn install_builtin_functions(reg: &mut TypeRegistry, b: &Builtins) {
    let mut i = Interner { reg, next_id: FIRST_FUNCTION_ID };
    let scalars = b.arithmetic();

    let mut get = vec![i.func(&b.void_ptr, &[&b.void_ptr_ptr])];
    let mut set = vec![i.func(&b.void, &[&b.void_ptr_ptr, &b.void_ptr])];
    for t in scalars {
        let ptr = i.reg.pointer_to(t);
        get.push(i.func(t, &[&ptr]));
        set.push(i.func(&b.void, &[&ptr, t]));
    }

    let mut arith = vec![i.func(&b.void_ptr, &[&b.void_ptr, &b.int32])];
    arith.extend(scalars.iter().map(|&t| i.func(t, &[t, t])));

    let compare: Vec<_> = scalars.iter().map(|&t| i.func(&b.int32, &[t, t])).collect();

    let malloc = i.func(&b.void_ptr, &[&b.uint32]);
    let free = i.func(&b.void, &[&b.void_ptr]);
    let memset = i.func(&b.void, &[&b.void_ptr, &b.int32, &b.uint32]);
    let memcpy = i.func(&b.void, &[&b.void_ptr, &b.void_ptr, &b.uint32]);
    let strlen = i.func(&b.uint32, &[&b.char_ptr]);
    let puts = i.func(&b.int32, &[&b.char_ptr]);

    let reg = i.reg;
    reg.register_function("get", &get);
    reg.register_function("set", &set);
    reg.register_function("add", &arith);
    reg.register_function("sub", &arith);
    for name in ["lt", "lte", "gt", "gte", "eq", "ne"] {
        reg.register_function(name, &compare);
    }
    reg.register_function("malloc", &[malloc]);
    reg.register_function("free", &[free]);
    reg.register_function("memset", &[memset]);
    reg.register_function("memcpy", &[memcpy]);
    reg.register_function("strlen", &[strlen]);
    reg.register_function("puts", &[puts]);
}

/// A registry with builtin types and functions installed.
pub fn standard_registry() -> (TypeRegistry, Builtins) {
    let mut reg = TypeRegistry::new();
    let builtins = install_builtin_types(&mut reg);
    install_builtin_functions(&mut reg, &builtins);
    (reg, builtins)
}
