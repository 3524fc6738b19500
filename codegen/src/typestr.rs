//! Type strings and their layout queries.
//!
//! Types are canonical strings: `"u8"`, `"uint"`, `"u8*"`, `"u32[10]"`,
//! `"void(uint,u8*)"`. A variable's storage type and its cast are both
//! type strings, which makes reinterpretation a string swap rather than a
//! graph edit. Named aggregate types resolve through the module's type
//! table.

use crate::func::Module;
use crate::lir::TypeId;

/// Width of a native integer type name, in bytes, with `uint`/`sint`
/// resolving to the GPR size. `None` when the name is not native.
pub fn native_size(name: &str, sizeof_gpr: u32) -> Option<u32> {
    match name {
        "u8" | "s8" => Some(1),
        "u16" | "s16" => Some(2),
        "u32" | "s32" => Some(4),
        "u64" | "s64" => Some(8),
        "uint" | "sint" => Some(sizeof_gpr),
        "void" => Some(0),
        _ => None,
    }
}

/// Is `name` a native integer or `void` type name?
pub fn is_native(name: &str) -> bool {
    native_size(name, 8).is_some()
}

/// Does a value of this type sign-extend when loaded into a register?
/// Pointers and function pointers do not.
pub fn is_signed(ty: &str) -> bool {
    matches!(ty, "s8" | "s16" | "s32" | "s64" | "sint")
}

/// Is this a pointer type (data or function pointer)?
pub fn is_pointer(ty: &str) -> bool {
    ty.ends_with('*') || ty.ends_with(')')
}

/// The type obtained by dereferencing a pointer type.
pub fn pointee(ty: &str) -> Option<&str> {
    ty.strip_suffix('*')
}

/// The element type and count of an array type `T[N]`.
pub fn array_elem(ty: &str) -> Option<(&str, u32)> {
    let open = ty.rfind('[')?;
    if !ty.ends_with(']') {
        return None;
    }
    let count: u32 = ty[open + 1..ty.len() - 1].parse().ok()?;
    Some((&ty[..open], count))
}

/// Look up a named aggregate type in the module's type table. Later
/// declarations shadow earlier ones, so the scan runs backwards.
pub fn lookup_named(module: &Module, name: &str) -> Option<TypeId> {
    module
        .types
        .iter()
        .rev()
        .find(|(_, t)| t.name == name)
        .map(|(id, _)| id)
}

/// Size in bytes of a value of type `ty`. `None` when the type is
/// unknown or incomplete.
pub fn sizeof(module: &Module, ty: &str, sizeof_gpr: u32) -> Option<u32> {
    if let Some(n) = native_size(ty, sizeof_gpr) {
        return Some(n);
    }
    if is_pointer(ty) {
        return Some(sizeof_gpr);
    }
    if let Some((elem, count)) = array_elem(ty) {
        return sizeof(module, elem, sizeof_gpr).map(|s| s * count);
    }
    let id = lookup_named(module, ty)?;
    let size = module.types[id].size;
    if size == 0 { None } else { Some(size) }
}

/// Number of bytes moved when loading or storing a value of this type
/// through a register: its size capped at the GPR size. Aggregates move
/// through memory copies, not registers, so this is only meaningful for
/// natives and pointers.
pub fn access_size(module: &Module, ty: &str, sizeof_gpr: u32) -> Option<u32> {
    let size = sizeof(module, ty, sizeof_gpr)?;
    if size == 0 || size > sizeof_gpr {
        return None;
    }
    // Register traffic is always a power-of-two width.
    if !size.is_power_of_two() {
        return None;
    }
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_sizes() {
        assert_eq!(native_size("u8", 8), Some(1));
        assert_eq!(native_size("s32", 8), Some(4));
        assert_eq!(native_size("uint", 4), Some(4));
        assert_eq!(native_size("mystruct", 8), None);
    }

    #[test]
    fn pointers_and_arrays() {
        assert!(is_pointer("u8*"));
        assert!(is_pointer("void(uint,u8*)"));
        assert!(!is_pointer("u8[4]"));
        assert_eq!(pointee("u32*"), Some("u32"));
        assert_eq!(array_elem("u32[10]"), Some(("u32", 10)));
        let m = Module::new();
        assert_eq!(sizeof(&m, "u32[10]", 8), Some(40));
        assert_eq!(sizeof(&m, "u8*[4]", 8), Some(32));
    }

    #[test]
    fn signedness() {
        assert!(is_signed("s8"));
        assert!(is_signed("sint"));
        assert!(!is_signed("u64"));
        assert!(!is_signed("u8*"));
    }
}
