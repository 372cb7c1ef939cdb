//! Growable stack used by the expression evaluator and the parser's scope tracking.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::fmt;

use crate::error::{HiiError, Result};

/// A LIFO stack that reports underflow as [`HiiError::StackUnderflow`] instead of returning `None`.
pub struct Stack<T> {
    items: Vec<T>,
}

impl<T> Stack<T> {
    /// Creates an empty stack.
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Creates an empty stack with room for `capacity` items before it grows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { items: Vec::with_capacity(capacity) }
    }

    /// Pushes `item`, growing the stack if it is full.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.items.len() == self.items.capacity() {
            self.items.try_reserve(self.items.capacity().max(4)).map_err(|_| HiiError::OutOfResources)?;
        }
        self.items.push(item);
        Ok(())
    }

    /// Pops the top item.
    pub fn pop(&mut self) -> Result<T> {
        self.items.pop().ok_or(HiiError::StackUnderflow)
    }

    /// Returns the top item without removing it.
    pub fn peek(&self) -> Result<&T> {
        self.items.last().ok_or(HiiError::StackUnderflow)
    }

    /// Returns the top item mutably without removing it.
    pub fn peek_mut(&mut self) -> Result<&mut T> {
        self.items.last_mut().ok_or(HiiError::StackUnderflow)
    }

    /// The number of items on the stack.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the stack holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates from the bottom of the stack to the top.
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Drops everything above `mark`, restoring a previously saved stack height.
    pub fn truncate(&mut self, mark: usize) {
        self.items.truncate(mark);
    }
}

impl<T: Clone> Stack<T> {
    /// Pushes a copy of the top item.
    pub fn dup(&mut self) -> Result<()> {
        let top = self.peek()?.clone();
        self.push(top)
    }

    /// Copies the stack contents, bottom first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter().rev()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_on_empty_stack_underflows() {
        let mut stack: Stack<u8> = Stack::new();
        assert_eq!(stack.pop(), Err(HiiError::StackUnderflow));
        assert_eq!(stack.peek(), Err(HiiError::StackUnderflow));
    }

    #[test]
    fn stack_grows_past_initial_capacity() {
        let mut stack = Stack::with_capacity(2);
        for i in 0..100u32 {
            stack.push(i).unwrap();
        }
        assert_eq!(stack.len(), 100);
        assert_eq!(stack.pop(), Ok(99));
    }

    #[test]
    fn truncate_restores_saved_height() {
        let mut stack = Stack::new();
        stack.push(1).unwrap();
        let mark = stack.len();
        stack.push(2).unwrap();
        stack.dup().unwrap();
        stack.truncate(mark);
        assert_eq!(stack.to_vec(), alloc::vec![1]);
    }
}
