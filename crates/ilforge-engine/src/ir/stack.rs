//! Persistent evaluation stack
//!
//! Every push or pop produces a new [`Stack`] and leaves the original intact,
//! so the stack recorded before and after each IR node, and the stacks
//! propagated along different control flow edges, never alias each other.

use std::fmt;
use std::sync::Arc;

use super::types::StackItem;

/// Immutable evaluation stack snapshot; index 0 is the bottom
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stack(Arc<Vec<StackItem>>);

impl Stack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack holding `items`, bottom first
    pub fn from_items(items: Vec<StackItem>) -> Self {
        Self(Arc::new(items))
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the stack is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Items, bottom first
    pub fn items(&self) -> &[StackItem] {
        &self.0
    }

    /// Item at `depth` counted from the bottom
    pub fn get(&self, depth: usize) -> Option<&StackItem> {
        self.0.get(depth)
    }

    /// Item `n` places below the top (0 is the top)
    pub fn peek(&self, n: usize) -> Option<&StackItem> {
        self.0.len().checked_sub(n + 1).and_then(|i| self.0.get(i))
    }

    /// New stack with `item` pushed
    pub fn push(&self, item: StackItem) -> Stack {
        let mut v = Vec::with_capacity(self.0.len() + 1);
        v.extend_from_slice(&self.0);
        v.push(item);
        Stack(Arc::new(v))
    }

    /// New stack with the top item removed, and that item
    pub fn pop(&self) -> Option<(Stack, StackItem)> {
        let top = self.0.last()?.clone();
        Some((Stack(Arc::new(self.0[..self.0.len() - 1].to_vec())), top))
    }

    /// New stack with the top `n` items removed, and those items bottom first
    pub fn pop_n(&self, n: usize) -> Option<(Stack, Vec<StackItem>)> {
        let split = self.0.len().checked_sub(n)?;
        Some((
            Stack(Arc::new(self.0[..split].to_vec())),
            self.0[split..].to_vec(),
        ))
    }

    /// Copy of the stack with all constant annotations dropped
    pub fn without_constants(&self) -> Stack {
        if self.0.iter().all(|i| i.constant.is_none()) {
            return self.clone();
        }
        Stack(Arc::new(
            self.0
                .iter()
                .map(|i| StackItem {
                    constant: None,
                    ..i.clone()
                })
                .collect(),
        ))
    }

    /// Whether two stacks agree in depth and in the computational type and size
    /// of every item
    pub fn same_shape(&self, other: &Stack) -> bool {
        self.len() == other.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.ct == b.ct && a.size == b.size)
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::Ct;

    #[test]
    fn test_push_pop_is_persistent() {
        let empty = Stack::new();
        let one = empty.push(StackItem::constant(Ct::Int32, 1, 8));
        let two = one.push(StackItem::of_ct(Ct::Object, 8));
        assert_eq!(empty.len(), 0);
        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 2);

        let (popped, top) = two.pop().unwrap();
        assert_eq!(top.ct, Ct::Object);
        assert_eq!(popped, one);
        assert_eq!(two.len(), 2);
        assert!(empty.pop().is_none());
    }

    #[test]
    fn test_peek_and_pop_n() {
        let s = Stack::new()
            .push(StackItem::constant(Ct::Int32, 1, 8))
            .push(StackItem::constant(Ct::Int32, 2, 8))
            .push(StackItem::constant(Ct::Int32, 3, 8));
        assert_eq!(s.peek(0).unwrap().constant, Some(3));
        assert_eq!(s.peek(2).unwrap().constant, Some(1));
        assert!(s.peek(3).is_none());
        let (rest, items) = s.pop_n(2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(items[0].constant, Some(2));
        assert!(s.pop_n(4).is_none());
    }

    #[test]
    fn test_shape_ignores_constants() {
        let a = Stack::new().push(StackItem::constant(Ct::Int32, 1, 8));
        let b = Stack::new().push(StackItem::constant(Ct::Int32, 2, 8));
        let c = Stack::new().push(StackItem::of_ct(Ct::Int64, 8));
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
        assert_eq!(a.without_constants().peek(0).unwrap().constant, None);
    }
}
