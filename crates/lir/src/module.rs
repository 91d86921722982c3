use ahash::AHashMap;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;

use crate::entities::{FuncId, GlobalRef};
use crate::types::Type;
use crate::Function;

/// A module-level global variable. `shadow` points at the matching shadow
/// global when one was declared; globals without a shadow are what the
/// `nonmarkedglobals_inactiveloads` switch is about.
#[derive(Clone, Debug)]
pub struct GlobalData {
    pub name: String,
    pub ty: Type,
    pub shadow: PackedOption<GlobalRef>,
}

/// A collection of functions and globals. The transform adds the
/// augmented and gradient functions it synthesizes to the same module.
#[derive(Default)]
pub struct Module {
    pub funcs: PrimaryMap<FuncId, Function>,
    pub globals: PrimaryMap<GlobalRef, GlobalData>,
    func_names: AHashMap<String, FuncId>,
    global_names: AHashMap<String, GlobalRef>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    /// Add a finished function. Its name must be unique in the module.
    pub fn define_function(&mut self, func: Function) -> FuncId {
        let name = func.name().to_owned();
        let id = self.funcs.push(func);
        let prev = self.func_names.insert(name, id);
        debug_assert!(prev.is_none(), "redefinition of function");
        id
    }

    /// Reserve an id under `name` with an empty body, to be filled in
    /// later with `replace_function`. Recursive references resolve to the
    /// reserved id while its body is still being built.
    pub fn reserve_function(&mut self, name: &str) -> FuncId {
        let mut func = Function::new();
        func.sig.name = name.to_owned();
        self.define_function(func)
    }

    pub fn replace_function(&mut self, id: FuncId, func: Function) {
        debug_assert_eq!(self.funcs[id].name(), func.name(), "replacement must keep the name");
        self.funcs[id] = func;
    }

    pub fn lookup_func(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    pub fn declare_global(&mut self, name: impl Into<String>, ty: Type) -> GlobalRef {
        let name = name.into();
        let id = self.globals.push(GlobalData { name: name.clone(), ty, shadow: None.into() });
        let prev = self.global_names.insert(name, id);
        debug_assert!(prev.is_none(), "redefinition of global");
        id
    }

    /// Link an already declared global as the shadow of `global`.
    pub fn set_shadow(&mut self, global: GlobalRef, shadow: GlobalRef) {
        self.globals[global].shadow = shadow.into();
    }

    /// Declare a shadow global for `global` (the `shadow` marker of the
    /// metadata contract) and return it.
    pub fn declare_shadow(&mut self, global: GlobalRef) -> GlobalRef {
        if let Some(shadow) = self.globals[global].shadow.expand() {
            return shadow;
        }
        let name = format!("{}.shadow", self.globals[global].name);
        let ty = self.globals[global].ty;
        let shadow = self.declare_global(name, ty);
        self.globals[global].shadow = shadow.into();
        shadow
    }

    pub fn lookup_global(&self, name: &str) -> Option<GlobalRef> {
        self.global_names.get(name).copied()
    }
}
