//! Register allocation
//!
//! Every evaluation stack depth is a virtual register per value class. The
//! IR records the stack before and after each node, so the set of (depth,
//! class) pairs a method ever uses is known up front. Pairs are assigned in
//! ascending depth order: the first ones to the target's register pool, the
//! rest to stack slots of their natural width. Value type instances always
//! live in slots sized to the largest instance seen at that depth.
//!
//! Two values that are live at the same time always sit at different depths,
//! so the assignment never places them in the same location.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::backend::{PhysReg, RegisterFile};
use crate::code::Code;
use crate::config::SpillPolicy;
use crate::ir::{Stack, ValueClass};
use crate::layout::align_up;

/// Error raised during register allocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("Out of {class:?} registers for stack depth {depth} in {method}")]
    OutOfRegisters {
        method: String,
        depth: usize,
        class: ValueClass,
    },
}

/// Where a stack value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Reg(PhysReg),
    /// Index into [`Allocation::slots`]
    Slot(u32),
}

/// Locations of every evaluation stack value of one method
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    locations: FxHashMap<(usize, ValueClass), Location>,
    slots: Vec<u32>,
    used: Vec<PhysReg>,
}

impl Allocation {
    /// Location of the value of `class` at stack depth `depth`
    pub fn location(&self, depth: usize, class: ValueClass) -> Option<Location> {
        self.locations.get(&(depth, class)).copied()
    }

    /// Size in bytes of every stack slot
    pub fn slots(&self) -> &[u32] {
        &self.slots
    }

    /// Pool registers handed out, in pool order
    pub fn used_registers(&self) -> &[PhysReg] {
        &self.used
    }

    /// Number of register-class values that did not get a register
    pub fn spill_count(&self) -> usize {
        self.locations
            .iter()
            .filter(|((_, class), loc)| {
                *class != ValueClass::Vt && matches!(loc, Location::Slot(_))
            })
            .count()
    }
}

/// Largest size seen for every (depth, class) pair of a stack
fn record(stack: &Stack, seen: &mut BTreeMap<(ValueClass, usize), u32>) {
    for (depth, item) in stack.items().iter().enumerate() {
        let size = seen.entry((item.class(), depth)).or_insert(0);
        *size = (*size).max(item.size);
    }
}

/// Assign a location to every stack value of `code`
pub fn allocate(
    code: &Code,
    regs: &RegisterFile,
    policy: SpillPolicy,
) -> Result<Allocation, AllocError> {
    let mut seen = BTreeMap::new();
    for node in code.ir() {
        record(&node.stack_before, &mut seen);
        record(&node.stack_after, &mut seen);
    }

    let mut alloc = Allocation::default();
    let mut next = FxHashMap::<ValueClass, usize>::default();
    // BTreeMap order: by class, then ascending depth
    for ((class, depth), size) in seen {
        let pool = regs.pool(class);
        let index = next.entry(class).or_insert(0);
        let location = if *index < pool.len() {
            let reg = pool[*index];
            *index += 1;
            alloc.used.push(reg);
            Location::Reg(reg)
        } else {
            if class != ValueClass::Vt && policy == SpillPolicy::Forbid {
                return Err(AllocError::OutOfRegisters {
                    method: code.symbol.clone(),
                    depth,
                    class,
                });
            }
            alloc.slots.push(align_up(size.max(1), 8));
            Location::Slot(alloc.slots.len() as u32 - 1)
        };
        alloc.locations.insert((depth, class), location);
    }
    Ok(alloc)
}
