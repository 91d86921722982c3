//! The tape: the ordered record of values the forward pass saves for the
//! reverse pass, and the `AugmentedReturn` describing a finished
//! augmented primal.

use ahash::AHashMap;
use indexmap::IndexMap;
use lir::{FuncId, Inst, Type};

use crate::uncacheable::{CanModRef, UncacheableArgs};
use crate::SigKey;

/// What a tape slot caches about an instruction. At most one slot exists
/// per `(instruction, kind)` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// The instruction's own primal value.
    Primal,
    /// The shadow of its pointer value.
    Shadow,
    /// The tape of the augmented sub-call.
    Tape,
}

/// A logical tape slot. `tys` has one entry per physical value carried;
/// only a flattened sub-call tape carries more than one.
#[derive(Clone, Debug)]
pub struct TapeSlot {
    pub index: usize,
    pub tys: Vec<Type>,
    /// Set when the slot's physical value is an induction-indexed buffer
    /// handle rather than the cached value itself.
    pub buffered: bool,
}

/// Insertion-ordered slot registry. Slots are allocated in forward order
/// and, per the tape discipline, consumed in reverse order.
#[derive(Default)]
pub struct TapeBuilder {
    slots: IndexMap<(Inst, CacheKind), TapeSlot, ahash::RandomState>,
    num_values: usize,
}

impl TapeBuilder {
    pub fn new() -> TapeBuilder {
        TapeBuilder::default()
    }

    /// Allocate (or return) the slot for `(inst, kind)`. The type vector
    /// of an existing slot must agree: a slot never changes its type.
    pub fn slot(&mut self, inst: Inst, kind: CacheKind, tys: &[Type], buffered: bool) -> usize {
        let next_index = self.slots.len();
        let num_values = &mut self.num_values;
        let slot = self.slots.entry((inst, kind)).or_insert_with(|| {
            *num_values += tys.len();
            TapeSlot { index: next_index, tys: tys.to_vec(), buffered }
        });
        debug_assert_eq!(&slot.tys[..], tys, "tape slot changed its type");
        slot.index
    }

    pub fn get(&self, inst: Inst, kind: CacheKind) -> Option<&TapeSlot> {
        self.slots.get(&(inst, kind))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Total number of physical values across all slots.
    pub fn num_values(&self) -> usize {
        self.num_values
    }

    /// Slots in allocation (forward) order.
    pub fn iter(&self) -> impl Iterator<Item = (&(Inst, CacheKind), &TapeSlot)> {
        self.slots.iter()
    }

    /// The flat physical types of the tape, in slot order.
    pub fn value_tys(&self) -> Vec<Type> {
        self.slots.values().flat_map(|slot| slot.tys.iter().copied()).collect()
    }

    /// Index of the first physical value of `slot` in the flat layout.
    pub fn value_offset(&self, index: usize) -> usize {
        self.slots.values().take_while(|slot| slot.index < index).map(|slot| slot.tys.len()).sum()
    }
}

/// Positions of the augmented primal's return values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AugmentedStruct {
    Tape,
    Return,
    DifferentialReturn,
}

/// One finished tape slot as the gradient sees it.
#[derive(Clone, Debug)]
pub struct TapeSlotDesc {
    pub inst: Inst,
    pub kind: CacheKind,
    /// Element types of the slot's values. For a buffered slot the
    /// physical value is one buffer handle pointer per element.
    pub tys: Vec<Type>,
    pub buffered: bool,
}

impl TapeSlotDesc {
    /// The types as they appear in the tape's physical layout.
    pub fn physical_tys(&self) -> Vec<Type> {
        if self.buffered {
            vec![Type::Ptr; self.tys.len()]
        } else {
            self.tys.clone()
        }
    }
}

/// Description of a finished (or reserved) augmented primal.
///
/// Immutable once the builder publishes it; recursive callers observe a
/// reserved entry whose tape is boxed behind an opaque pointer.
pub struct AugmentedReturn {
    pub func: FuncId,
    pub key: SigKey,
    /// Physical types of the tape as returned by the augmented function:
    /// the flat slot values, or a single pointer when boxed.
    pub tape_tys: Vec<Type>,
    /// The tape travels as one opaque heap pointer (self-recursive
    /// functions, and reserved in-progress entries).
    pub tape_boxed: bool,
    /// When boxed: the real types of the values pushed onto the runtime
    /// tape, in forward (push) order.
    pub boxed_tys: Vec<Type>,
    /// Return-struct layout: position of each logical part among the
    /// return values.
    pub return_index: AHashMap<AugmentedStruct, usize>,
    /// The logical slots in forward allocation order.
    pub slots: Vec<TapeSlotDesc>,
    /// Analysis results the gradient pass reuses instead of recomputing.
    pub uncacheable_args_per_call: UncacheableArgs,
    pub cacheable_load_flags: CanModRef,
    /// Augmentations created for the call sites inside this function.
    pub sub_augmentations: AHashMap<Inst, SigKey>,
}

impl AugmentedReturn {
    /// A reserved in-progress entry: same signature surface, boxed tape,
    /// no slots yet.
    pub(crate) fn reserved(func: FuncId, key: SigKey, return_used: bool, shadow_return: bool) -> Self {
        let mut return_index = AHashMap::new();
        return_index.insert(AugmentedStruct::Tape, 0);
        if return_used {
            return_index.insert(AugmentedStruct::Return, 1);
        }
        if shadow_return {
            return_index.insert(AugmentedStruct::DifferentialReturn, if return_used { 2 } else { 1 });
        }
        AugmentedReturn {
            func,
            key,
            tape_tys: vec![Type::Ptr],
            tape_boxed: true,
            boxed_tys: Vec::new(),
            return_index,
            slots: Vec::new(),
            uncacheable_args_per_call: UncacheableArgs::new(),
            cacheable_load_flags: CanModRef::new(),
            sub_augmentations: AHashMap::new(),
        }
    }

    /// The slot index of `(inst, kind)`, when one was allocated.
    pub fn slot_index(&self, inst: Inst, kind: CacheKind) -> Option<usize> {
        self.slots.iter().position(|slot| slot.inst == inst && slot.kind == kind)
    }

    /// Number of physical tape values in the augmented return.
    pub fn num_tape_values(&self) -> usize {
        self.tape_tys.len()
    }

    pub fn tape_value_range(&self) -> std::ops::Range<usize> {
        let start = self.return_index[&AugmentedStruct::Tape];
        start..start + self.num_tape_values()
    }

    /// Index of the primal return among the augmented return values.
    pub fn primal_return_index(&self) -> Option<usize> {
        self.return_index.get(&AugmentedStruct::Return).map(|idx| {
            // Parts after the tape shift by the flattened tape width.
            idx + self.num_tape_values() - 1
        })
    }

    pub fn shadow_return_index(&self) -> Option<usize> {
        self.return_index.get(&AugmentedStruct::DifferentialReturn).map(|idx| {
            idx + self.num_tape_values() - 1
        })
    }
}
