//! IR entity references.
//!
//! Instructions reference other entities of the function (blocks, values,
//! stack slots, external functions) through compact `u32` newtypes instead
//! of Rust references. There is a separate index type for each entity kind
//! so we don't lose type safety, and each implements `Display` in the form
//! used by the textual IR.

use cranelift_entity::entity_impl;

/// An opaque reference to a basic block.
///
/// While the order is stable, it is arbitrary and does not necessarily
/// resemble the layout order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an SSA value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// A reference to an external function declared in a function's preamble.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncRef(u32);
entity_impl!(FuncRef, "fn");

/// A reference to a function defined in a [`Module`](crate::Module).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "func");

/// A reference to a global variable of the enclosing module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalRef(u32);
entity_impl!(GlobalRef, "gv");

/// A reference to a typed, zero-initialized stack slot of a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSlot(u32);
entity_impl!(StackSlot, "ss");

/// `entity_impl!` provides `EntityRef` but not the plain `usize`
/// conversions the bit set and worklist crates are bounded on.
macro_rules! usize_conversions {
    ($($ent:ident),*) => {
        $(
            impl From<usize> for $ent {
                #[inline]
                fn from(idx: usize) -> $ent {
                    <$ent as cranelift_entity::EntityRef>::new(idx)
                }
            }

            impl From<$ent> for usize {
                #[inline]
                fn from(ent: $ent) -> usize {
                    <$ent as cranelift_entity::EntityRef>::index(ent)
                }
            }
        )*
    };
}

usize_conversions!(Block, Value, Inst, FuncRef, FuncId, GlobalRef, StackSlot);
