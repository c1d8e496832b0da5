//! Builtin type maps: prototype methods for the core types.
//!
//! The five type maps are ordinary map values holding the standard
//! intrinsics' wrapper functions, so `"abc".len` and `len("abc")` dispatch
//! to exactly the same code. Each type name is also registered as an
//! intrinsic returning the machine's map, which is what makes
//! `x isa string` work.

use std::rc::Rc;

use crate::intrinsic::{IntrinsicRegistry, IntrinsicResult, IntrinsicSpec};
use crate::value::{Value, ValueMap};
use crate::vm::BuiltinTypes;

const STRING_METHODS: &[&str] = &[
    "len", "upper", "lower", "val", "code", "split", "replace", "indexOf", "hasIndex", "insert",
    "remove", "indexes", "values",
];

const LIST_METHODS: &[&str] = &[
    "len", "push", "pop", "pull", "insert", "remove", "indexOf", "hasIndex", "indexes", "values",
    "sort", "shuffle", "sum", "join", "replace",
];

const MAP_METHODS: &[&str] = &[
    "len", "push", "pop", "pull", "remove", "indexOf", "hasIndex", "indexes", "values", "sum",
    "replace",
];

fn type_map(reg: &IntrinsicRegistry, methods: &[&str]) -> Value {
    let mut map = ValueMap::new();
    for name in methods {
        if let Some(intrinsic) = reg.by_name(name) {
            map.insert_str(name, intrinsic.wrapper());
        }
    }
    Value::map(map)
}

/// Build the type maps from already-registered intrinsics, and register the
/// type-name intrinsics that expose them to script.
pub(crate) fn install(reg: &mut IntrinsicRegistry) -> BuiltinTypes {
    let types = BuiltinTypes {
        string: type_map(reg, STRING_METHODS),
        list: type_map(reg, LIST_METHODS),
        map: type_map(reg, MAP_METHODS),
        number: Value::map(ValueMap::new()),
        function: Value::map(ValueMap::new()),
    };

    reg.register(
        IntrinsicSpec::new("string"),
        Rc::new(|vm, _| Ok(IntrinsicResult::Done(vm.types().string.clone()))),
    );
    reg.register(
        IntrinsicSpec::new("list"),
        Rc::new(|vm, _| Ok(IntrinsicResult::Done(vm.types().list.clone()))),
    );
    reg.register(
        IntrinsicSpec::new("map"),
        Rc::new(|vm, _| Ok(IntrinsicResult::Done(vm.types().map.clone()))),
    );
    reg.register(
        IntrinsicSpec::new("number"),
        Rc::new(|vm, _| Ok(IntrinsicResult::Done(vm.types().number.clone()))),
    );
    reg.register(
        IntrinsicSpec::new("funcRef"),
        Rc::new(|vm, _| Ok(IntrinsicResult::Done(vm.types().function.clone()))),
    );

    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::register_standard;

    #[test]
    fn test_type_maps_share_wrappers() {
        let mut reg = IntrinsicRegistry::new();
        register_standard(&mut reg);
        let types = install(&mut reg);
        let global_len = reg.by_name("len").unwrap().wrapper();
        let Value::Map(string_type) = &types.string else {
            panic!("string type should be a map");
        };
        let method = string_type.borrow().get_str("len").unwrap();
        assert!(method.ref_eq(&global_len));
        let Value::Map(list_type) = &types.list else {
            panic!("list type should be a map");
        };
        assert!(list_type.borrow().get_str("sort").is_some());
        assert!(list_type.borrow().get_str("upper").is_none());
    }
}
