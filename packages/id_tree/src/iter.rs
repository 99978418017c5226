use std::any::type_name;
use std::fmt;
use std::iter::FusedIterator;
use std::pin::Pin;

use crate::IdTree;

/// Iterator over the IDs and elements of an [`IdTree`], in ascending ID order.
///
/// Created by [`IdTree::iter()`].
pub struct Iter<'a, T> {
    ids: Ids<'a, T>,
}

impl<'a, T> Iter<'a, T> {
    pub(crate) fn new(tree: &'a IdTree<T>) -> Self {
        Self {
            ids: Ids::new(tree),
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (u32, Pin<&'a T>);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        let tree = self.ids.tree;

        let element = tree
            .get(id)
            .expect("ids yielded by the tree's own traversal are always present");

        Some((id, element))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
impl<T> FusedIterator for Iter<'_, T> {}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("item_type", &format_args!("{}", type_name::<T>()))
            .field("next", &self.ids.next)
            .field("remaining", &self.ids.remaining)
            .finish()
    }
}

/// Iterator over the IDs present in an [`IdTree`], in ascending order.
///
/// Created by [`IdTree::ids()`].
pub struct Ids<'a, T> {
    tree: &'a IdTree<T>,

    next: Option<u32>,

    remaining: usize,
}

impl<'a, T> Ids<'a, T> {
    pub(crate) fn new(tree: &'a IdTree<T>) -> Self {
        Self {
            tree,
            next: tree.first(),
            remaining: tree.len(),
        }
    }
}

impl<T> Iterator for Ids<'_, T> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;

        self.next = self.tree.next_after(id);
        self.remaining = self
            .remaining
            .checked_sub(1)
            .expect("the tree cannot yield more ids than it holds");

        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Ids<'_, T> {}
impl<T> FusedIterator for Ids<'_, T> {}

impl<T> fmt::Debug for Ids<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ids")
            .field("item_type", &format_args!("{}", type_name::<T>()))
            .field("next", &self.next)
            .field("remaining", &self.remaining)
            .finish()
    }
}
