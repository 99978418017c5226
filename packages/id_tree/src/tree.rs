use std::any::type_name;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::ptr::NonNull;
use std::{fmt, thread};

use block_pool::BlockPool;
use scopeguard::ScopeGuard;

use crate::{
    BuildError, DropPolicy, Error, IdTreeBuilder, Ids, Iter, Link, PageArena, PageId, Result, keep_above,
    levels_for, slot_bits,
};

/// A sparse map from `u32` IDs to pinned elements, organized as a multi-level radix tree.
///
/// Each level of the tree consumes [`fan_out_bits()`][1] bits of an ID. Internal pages hold links
/// to child pages and leaf pages hold links to elements. Lookups walk one page per level, so they
/// run in time proportional to the number of significant bits in the largest ID ever used.
///
/// Elements live in a slab allocator owned by the tree, separate from the index pages. An element
/// never moves while its ID is present, no matter how the tree around it grows or shrinks.
///
/// There are multiple ways to insert elements:
///
/// * [`set()`][2] - stores a value at a caller-chosen ID, overwriting in place if present.
/// * [`append()`][3] - stores a value at the next free ID (one past the largest ID ever used)
///   and reports the ID.
/// * [`set_with()`][4] and [`append_with()`][5] - let the caller initialize the element in its
///   final memory location.
///
/// # Out of band access
///
/// The tree does not keep references to its elements or create new references unless you
/// explicitly ask for one, so it is valid to access elements via pointers obtained from
/// [`get_ptr()`][6] and to create custom references to them from unsafe code even when not
/// holding a reference to the tree, as long as you do not ask the tree to concurrently create a
/// conflicting reference. Such pointers are valid until the ID is removed, the tree is cleared
/// or the tree is dropped.
///
/// # Resource usage
///
/// Removing an element releases every index page that becomes empty as a result, except the
/// root. The depth of the tree never decreases, except via [`clear()`][7]. Element storage keeps
/// its capacity for reuse until the tree is dropped.
///
/// # Example
///
/// ```
/// use id_tree::IdTree;
///
/// let mut tree = IdTree::<&str>::new();
///
/// tree.set(3, "three").unwrap();
/// tree.set(300, "three hundred").unwrap();
///
/// let (id, _) = tree.append("next").unwrap();
/// assert_eq!(id, 301);
///
/// assert_eq!(tree.get(3).as_deref(), Some(&"three"));
/// assert_eq!(tree.remove(300), Some("three hundred"));
///
/// let ids = tree.ids().collect::<Vec<_>>();
/// assert_eq!(ids, vec![3, 301]);
/// ```
///
/// [1]: Self::fan_out_bits
/// [2]: Self::set
/// [3]: Self::append
/// [4]: Self::set_with
/// [5]: Self::append_with
/// [6]: Self::get_ptr
/// [7]: Self::clear
pub struct IdTree<T> {
    /// Storage for the elements themselves. Leaf page links point into this pool.
    elements: BlockPool,

    pages: PageArena<T>,

    fan_out_bits: u32,

    /// `None` until the first insertion (or after `clear()`). May be an empty page after every
    /// element has been removed - the root is never released by removal.
    root: Option<PageId>,

    /// Number of levels from the root to the leaves. Zero if there is no root.
    depth: u32,

    /// Number of elements in the tree.
    count: usize,

    /// One greater than the largest ID ever inserted. Wider than the key so that inserting
    /// `u32::MAX` does not overflow.
    next_id: u64,

    drop_policy: DropPolicy,

    large_id_warning: Option<u32>,
}

impl<T> IdTree<T> {
    pub(crate) fn new_inner(
        elements: BlockPool,
        fan_out_bits: u32,
        drop_policy: DropPolicy,
        large_id_warning: Option<u32>,
    ) -> Self {
        Self {
            elements,
            pages: PageArena::new(fan_out_bits),
            fan_out_bits,
            root: None,
            depth: 0,
            count: 0,
            next_id: 0,
            drop_policy,
            large_id_warning,
        }
    }

    /// Creates a new [`IdTree`] with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn new() -> Self {
        Self::builder()
            .build()
            .expect("default configuration is valid for every element type that is not zero-sized")
    }

    /// Creates a new [`IdTree`] that consumes `bits` ID bits per tree level, with every other
    /// setting at its default.
    ///
    /// # Errors
    ///
    /// Returns an error if `T` is zero-sized or `bits` is outside
    /// [`MIN_FAN_OUT_BITS`][crate::MIN_FAN_OUT_BITS]..=[`MAX_FAN_OUT_BITS`][crate::MAX_FAN_OUT_BITS].
    pub fn with_fan_out_bits(bits: u32) -> std::result::Result<Self, BuildError> {
        Self::builder().fan_out_bits(bits).build()
    }

    /// Starts building a new [`IdTree`].
    ///
    /// Use this when you want to customize the tree configuration beyond the defaults.
    ///
    /// # Example
    ///
    /// ```rust
    /// use id_tree::IdTree;
    ///
    /// let tree = IdTree::<u32>::builder().fan_out_bits(4).build().unwrap();
    ///
    /// assert_eq!(tree.fan_out_bits(), 4);
    /// assert!(tree.is_empty());
    /// ```
    pub fn builder() -> IdTreeBuilder<T> {
        IdTreeBuilder::new()
    }

    /// The number of elements in the tree.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the tree holds no elements.
    ///
    /// An empty tree may still be holding a root page and element storage capacity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The number of levels from the root page to the leaf pages. Zero for a tree that has
    /// never held an element.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The number of index pages currently allocated.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// The number of ID bits consumed per tree level.
    #[must_use]
    pub fn fan_out_bits(&self) -> u32 {
        self.fan_out_bits
    }

    /// The ID [`append()`][Self::append] would use: one greater than the largest ID ever
    /// inserted, or 0 if nothing has been inserted.
    ///
    /// This is `u32::MAX + 1` once `u32::MAX` has been used, at which point appending fails.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Whether an element is stored at `id`.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.locate(id).is_some()
    }

    /// Gets a pinned reference to the element stored at `id`, if any.
    ///
    /// # Example
    ///
    /// ```rust
    /// use id_tree::IdTree;
    ///
    /// let mut tree = IdTree::<String>::new();
    /// tree.set(5, "five".to_string()).unwrap();
    ///
    /// assert_eq!(tree.get(5).as_deref().map(String::as_str), Some("five"));
    /// assert!(tree.get(6).is_none());
    /// ```
    #[must_use]
    pub fn get(&self, id: u32) -> Option<Pin<&T>> {
        self.locate(id).map(|(_, ptr)| {
            // SAFETY: Elements are initialized while linked from a leaf, and the shared borrow of
            // the tree prevents anyone from creating an exclusive reference through the tree.
            // Items are always pinned - that is the point of this collection.
            unsafe { Pin::new_unchecked(ptr.as_ref()) }
        })
    }

    /// Gets an exclusive pinned reference to the element stored at `id`, if any.
    #[must_use]
    pub fn get_mut(&mut self, id: u32) -> Option<Pin<&mut T>> {
        self.locate(id).map(|(_, ptr)| {
            // SAFETY: Elements are initialized while linked from a leaf, and the exclusive borrow
            // of the tree prevents any other reference being created through the tree.
            unsafe { Pin::new_unchecked(&mut *ptr.as_ptr()) }
        })
    }

    /// Gets a pointer to the element stored at `id`, if any.
    ///
    /// The pointer remains valid and keeps pointing at this element until the ID is removed,
    /// the tree is cleared or the tree is dropped. See "Out of band access" on [`IdTree`].
    #[must_use]
    pub fn get_ptr(&self, id: u32) -> Option<NonNull<T>> {
        self.locate(id).map(|(_, ptr)| ptr)
    }

    /// Stores `value` at `id` and returns a pinned reference to it.
    ///
    /// If `id` is vacant, a new element slot is allocated, growing the tree if `id` needs more
    /// levels than it currently has. If `id` is present, the previous value is dropped and the
    /// new value takes its place at the same memory address.
    ///
    /// # Errors
    ///
    /// Returns an error if element storage needed to grow but memory was not available and the
    /// [allocation policy][crate::AllocationPolicy] permits reporting this. The tree is unchanged.
    ///
    /// # Example
    ///
    /// ```rust
    /// use id_tree::IdTree;
    ///
    /// let mut tree = IdTree::<u32>::new();
    ///
    /// let first = tree.set(7, 1).unwrap().into_ref().get_ref() as *const u32;
    /// let second = tree.set(7, 2).unwrap().into_ref().get_ref() as *const u32;
    ///
    /// // Overwriting keeps the element where it was.
    /// assert_eq!(first, second);
    /// assert_eq!(tree.len(), 1);
    /// assert_eq!(*tree.get(7).unwrap(), 2);
    /// ```
    pub fn set(&mut self, id: u32, value: T) -> Result<Pin<&mut T>> {
        // SAFETY: The closure fully initializes the element and cannot panic.
        unsafe {
            self.set_with(id, |uninit: &mut MaybeUninit<T>| {
                uninit.write(value);
            })
        }
    }

    /// Stores a value at `id` that is initialized in place by `f`, returning a pinned reference.
    ///
    /// Behaves like [`set()`][Self::set] except that the element memory is handed to `f`
    /// uninitialized. If `id` was present, the previous value has already been dropped when `f`
    /// is called, and the new value will occupy the same memory address.
    ///
    /// If `f` panics, `id` is left vacant and the tree is otherwise unchanged.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::mem::MaybeUninit;
    ///
    /// use id_tree::IdTree;
    ///
    /// let mut tree = IdTree::<[u8; 4]>::new();
    ///
    /// // SAFETY: The closure fully initializes the element.
    /// let element = unsafe {
    ///     tree.set_with(12, |uninit: &mut MaybeUninit<[u8; 4]>| {
    ///         uninit.write(*b"data");
    ///     })
    /// }
    /// .unwrap();
    ///
    /// assert_eq!(&*element, b"data");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if element storage needed to grow but memory was not available and the
    /// [allocation policy][crate::AllocationPolicy] permits reporting this. The tree is unchanged.
    ///
    /// # Safety
    ///
    /// The closure must fully initialize the `MaybeUninit<T>` before returning.
    pub unsafe fn set_with(
        &mut self,
        id: u32,
        f: impl FnOnce(&mut MaybeUninit<T>),
    ) -> Result<Pin<&mut T>> {
        if let Some(threshold) = self.large_id_warning.filter(|threshold| id >= *threshold) {
            tracing::warn!(
                id,
                threshold,
                item_type = type_name::<T>(),
                "inserting unusually large id into id tree"
            );
        }

        if let Some((_, existing)) = self.locate(id) {
            // If dropping the old value or initializing the new one panics, the slot no longer
            // holds a valid value, so the ID must go away without another drop.
            let guard = scopeguard::guard(&mut *self, |tree| tree.discard(id));

            // SAFETY: The element is initialized while linked and nobody else references it
            // because we hold an exclusive borrow of the tree.
            unsafe {
                existing.drop_in_place();
            }

            // SAFETY: The slot is valid for writes of T; MaybeUninit<T> has the same layout.
            f(unsafe { &mut *existing.cast::<MaybeUninit<T>>().as_ptr() });

            _ = ScopeGuard::into_inner(guard);

            // SAFETY: The caller guarantees that `f` initialized the element.
            return Ok(unsafe { Pin::new_unchecked(&mut *existing.as_ptr()) });
        }

        // Everything fallible happens before the tree is touched, so a failure leaves no trace.
        let element = self.elements.allocate()?.cast::<T>();

        {
            let guard = scopeguard::guard(&mut self.elements, |elements| {
                // SAFETY: The block came from this pool a moment ago and was never linked.
                unsafe { elements.release(element.cast()) };
            });

            // SAFETY: The block is sized and aligned for T; MaybeUninit<T> has the same layout.
            f(unsafe { &mut *element.cast::<MaybeUninit<T>>().as_ptr() });

            _ = ScopeGuard::into_inner(guard);
        }

        let leaf_id = self.ensure_leaf(id);
        let mut leaf = self.pages.get_mut(leaf_id);
        let slot = leaf.slot_for(id);
        leaf.occupy(slot, Link::Element(element));

        self.count = self
            .count
            .checked_add(1)
            .expect("element count cannot exceed the number of possible IDs");

        self.next_id = self.next_id.max(u64::from(id).wrapping_add(1));

        // SAFETY: The caller guarantees that `f` initialized the element. It is pinned because
        // elements never move while linked.
        Ok(unsafe { Pin::new_unchecked(&mut *element.as_ptr()) })
    }

    /// Stores `value` at the next free ID and returns that ID with a pinned reference to the value.
    ///
    /// The next free ID is one greater than the largest ID ever inserted (even if that ID has
    /// since been removed), or 0 for a tree that has never held an element.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdSpaceExhausted`] if `u32::MAX` has already been used, or an allocation
    /// error as described on [`set()`][Self::set]. The tree is unchanged in either case.
    pub fn append(&mut self, value: T) -> Result<(u32, Pin<&mut T>)> {
        let id = self.peek_next_id()?;

        self.set(id, value).map(|element| (id, element))
    }

    /// Stores a value initialized in place by `f` at the next free ID and returns that ID with a
    /// pinned reference to the value.
    ///
    /// # Errors
    ///
    /// See [`append()`][Self::append].
    ///
    /// # Safety
    ///
    /// The closure must fully initialize the `MaybeUninit<T>` before returning.
    pub unsafe fn append_with(
        &mut self,
        f: impl FnOnce(&mut MaybeUninit<T>),
    ) -> Result<(u32, Pin<&mut T>)> {
        let id = self.peek_next_id()?;

        // SAFETY: Forwarding guarantee from caller that the closure initializes the element.
        unsafe { self.set_with(id, f) }.map(|element| (id, element))
    }

    fn peek_next_id(&self) -> Result<u32> {
        u32::try_from(self.next_id).map_err(|_| Error::IdSpaceExhausted)
    }

    /// Removes the element stored at `id` and returns it, or `None` if `id` is vacant.
    ///
    /// Every index page left empty by the removal is released, walking up towards the root. The
    /// root page itself is kept and the depth of the tree does not change.
    ///
    /// # Example
    ///
    /// ```rust
    /// use id_tree::IdTree;
    ///
    /// let mut tree = IdTree::<char>::new();
    /// tree.set(1000, 'x').unwrap();
    ///
    /// assert_eq!(tree.remove(1000), Some('x'));
    /// assert_eq!(tree.remove(1000), None);
    /// assert!(tree.is_empty());
    /// ```
    pub fn remove(&mut self, id: u32) -> Option<T> {
        if u64::from(id) >= self.next_id {
            return None;
        }

        let (leaf, element) = self.locate(id)?;

        // SAFETY: The element is initialized while linked. We unlink it right after, so the
        // value we read out is the only copy that will ever be dropped.
        let value = unsafe { element.read() };

        self.detach(leaf, id, element);

        Some(value)
    }

    /// Removes every element, dropping them, and releases every index page.
    ///
    /// The tree returns to the state of a freshly created tree, including depth and next free
    /// ID, except that element storage keeps its capacity for reuse.
    ///
    /// If an element's destructor panics, the remaining elements are still dropped and the tree
    /// is left empty before the panic continues.
    pub fn clear(&mut self) {
        // Unlink everything before running any destructor, so a panicking destructor cannot
        // leave dropped elements reachable from the tree.
        let pages = self.pages.take();
        self.root = None;
        self.depth = 0;
        self.count = 0;
        self.next_id = 0;

        Self::drop_detached(&mut self.elements, &pages);
    }

    /// Returns the smallest ID present in the tree, or `None` if the tree is empty.
    #[must_use]
    pub fn first(&self) -> Option<u32> {
        self.lowest_in(self.root?, 0)
    }

    /// Returns the smallest ID present in the tree that is greater than `id`, or `None` if there
    /// is no such ID.
    ///
    /// `id` itself does not need to be present.
    ///
    /// # Example
    ///
    /// ```rust
    /// use id_tree::IdTree;
    ///
    /// let mut tree = IdTree::<u8>::new();
    /// for id in [3, 18, 11, 22] {
    ///     tree.set(id, 0).unwrap();
    /// }
    ///
    /// assert_eq!(tree.first(), Some(3));
    /// assert_eq!(tree.next_after(3), Some(11));
    /// assert_eq!(tree.next_after(12), Some(18));
    /// assert_eq!(tree.next_after(22), None);
    /// ```
    #[must_use]
    pub fn next_after(&self, id: u32) -> Option<u32> {
        let root = self.root?;

        if levels_for(id, self.fan_out_bits) > self.depth {
            // Every present ID is smaller than one that needs more levels than the tree has.
            return None;
        }

        // Descend along the path of `id` for as long as that path exists.
        let mut page_id = root;

        loop {
            let page = self.pages.get(page_id);

            if page.is_leaf() {
                break;
            }

            match page.link(page.slot_for(id)) {
                Link::Page(child) => page_id = child,
                Link::Vacant => break,
                Link::Element(_) => panic!(
                    "internal page at lsb {} linked to an element in tree of {}",
                    page.lsb(),
                    type_name::<T>()
                ),
            }
        }

        // Climb via parent links until some page has an occupied slot beyond the path of `id`.
        loop {
            let page = self.pages.get(page_id);

            let after = page
                .slot_for(id)
                .checked_add(1)
                .expect("slot indexes are bounded by the page width");

            if let Some((slot, link)) = page.occupied_from(after) {
                let prefix = keep_above(id, page.lsb().saturating_add(self.fan_out_bits))
                    | slot_bits(slot, page.lsb());

                return match link {
                    Link::Element(_) => Some(prefix),
                    Link::Page(child) => self.lowest_in(child, prefix),
                    Link::Vacant => unreachable!("occupied_from() never yields vacant links"),
                };
            }

            page_id = page.parent()?;
        }
    }

    /// Iterates over the present IDs and their elements in ascending ID order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter::new(self)
    }

    /// Iterates over the present IDs in ascending order.
    pub fn ids(&self) -> Ids<'_, T> {
        Ids::new(self)
    }

    /// Creates an independent tree with the same configuration whose elements are produced by
    /// `f` from each element of this tree, visited in ascending ID order.
    ///
    /// The copy shares no index pages and no element storage with this tree. Its next free ID
    /// and depth match this tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy's element storage could not grow and the
    /// [allocation policy][crate::AllocationPolicy] permits reporting this.
    ///
    /// # Example
    ///
    /// ```rust
    /// use id_tree::IdTree;
    ///
    /// let mut tree = IdTree::<u32>::new();
    /// tree.set(1, 10).unwrap();
    /// tree.set(40, 400).unwrap();
    ///
    /// let scaled = tree.copy_with(|id, value| value + id).unwrap();
    ///
    /// assert_eq!(*scaled.get(1).unwrap(), 11);
    /// assert_eq!(*scaled.get(40).unwrap(), 440);
    /// ```
    pub fn copy_with(&self, mut f: impl FnMut(u32, &T) -> T) -> Result<Self> {
        let elements = BlockPool::builder()
            .block_layout(self.elements.block_layout())
            .growth(self.elements.growth())
            .allocation_policy(self.elements.allocation_policy())
            .build()
            .expect("configuration was already validated when this tree was built");

        let mut copy = Self::new_inner(
            elements,
            self.fan_out_bits,
            self.drop_policy,
            self.large_id_warning,
        );

        // The copy has the same allocation needs as we do, so get them out of the way up front.
        copy.elements.reserve(self.count)?;

        for (id, value) in self {
            copy.set(id, f(id, value.get_ref()))?;
        }

        if copy.depth < self.depth {
            copy.grow_depth(self.depth);
        }

        copy.next_id = self.next_id;

        Ok(copy)
    }

    /// Ensures element storage can hold at least `additional` more elements without growing.
    ///
    /// # Errors
    ///
    /// Returns an error if element storage could not grow and the
    /// [allocation policy][crate::AllocationPolicy] permits reporting this.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        Ok(self.elements.reserve(additional)?)
    }

    /// Finds the leaf page and element pointer for `id`, if present.
    fn locate(&self, id: u32) -> Option<(PageId, NonNull<T>)> {
        let mut page_id = self.root?;

        if levels_for(id, self.fan_out_bits) > self.depth {
            return None;
        }

        loop {
            let page = self.pages.get(page_id);

            match page.link(page.slot_for(id)) {
                Link::Vacant => return None,
                Link::Page(child) => page_id = child,
                Link::Element(element) => return Some((page_id, element)),
            }
        }
    }

    /// The smallest ID in the subtree rooted at `page_id`, whose higher ID bits are `prefix`.
    fn lowest_in(&self, mut page_id: PageId, mut prefix: u32) -> Option<u32> {
        loop {
            let page = self.pages.get(page_id);

            // Only the root can be empty, every other page is released when it becomes empty.
            let (slot, link) = page.occupied_from(0)?;
            prefix |= slot_bits(slot, page.lsb());

            match link {
                Link::Element(_) => return Some(prefix),
                Link::Page(child) => page_id = child,
                Link::Vacant => unreachable!("occupied_from() never yields vacant links"),
            }
        }
    }

    /// Returns the leaf page that `id` belongs in, creating the path to it as needed.
    fn ensure_leaf(&mut self, id: u32) -> PageId {
        let required = levels_for(id, self.fan_out_bits);

        if required > self.depth {
            self.grow_depth(required);
        }

        let mut page_id = self
            .root
            .expect("grow_depth() always leaves a root behind");

        loop {
            let page = self.pages.get(page_id);

            if page.is_leaf() {
                return page_id;
            }

            let lsb = page.lsb();
            let child_lsb = page.child_lsb();
            let slot = page.slot_for(id);

            page_id = match page.link(slot) {
                Link::Page(child) => child,
                Link::Vacant => {
                    let child = self.pages.allocate(child_lsb, Some(page_id));
                    self.pages
                        .get_mut(page_id)
                        .occupy(slot, Link::Page(child));
                    child
                }
                Link::Element(_) => panic!(
                    "internal page at lsb {lsb} linked to an element in tree of {}",
                    type_name::<T>()
                ),
            };
        }
    }

    /// Adds levels on top of the tree until it is `required` levels deep.
    ///
    /// Existing IDs all have zero bits in the newly indexed positions, so the old root becomes
    /// the child in slot 0 of the new level above it. An old root without any occupied slots is
    /// discarded instead, as is every intermediate level that would only lead to it.
    fn grow_depth(&mut self, required: u32) {
        debug_assert!(required > self.depth, "grow_depth() must add at least one level");

        let previous_depth = self.depth;

        let old_root = match self.root.take() {
            Some(root) if self.pages.get(root).occupied() == 0 => {
                self.pages.release(root);
                None
            }
            other => other,
        };

        let mut below = old_root;
        let first_new_level = if old_root.is_some() {
            self.depth
        } else {
            required.wrapping_sub(1)
        };

        for level in first_new_level..required {
            let lsb = level
                .checked_mul(self.fan_out_bits)
                .expect("levels are bounded by the key width");

            let page = self.pages.allocate(lsb, None);

            if let Some(child) = below {
                self.pages.get_mut(child).set_parent(Some(page));
                self.pages.get_mut(page).occupy(0, Link::Page(child));
            }

            below = Some(page);
        }

        self.root = below;
        self.depth = required;

        tracing::debug!(
            from = previous_depth,
            to = required,
            pages = self.pages.len(),
            item_type = type_name::<T>(),
            "id tree grew in depth"
        );
    }

    /// Unlinks and releases an element, releasing any index pages left empty, except the root.
    ///
    /// The element value must already have been moved out or dropped.
    fn detach(&mut self, leaf: PageId, id: u32, element: NonNull<T>) {
        // SAFETY: The element came from this pool when it was linked and is unlinked below, so
        // it is released exactly once.
        unsafe {
            self.elements.release(element.cast());
        }

        self.count = self
            .count
            .checked_sub(1)
            .expect("detached an element from a tree that had none");

        let mut page_id = leaf;

        loop {
            let mut page = self.pages.get_mut(page_id);
            let slot = page.slot_for(id);
            page.vacate(slot);

            if page.occupied() > 0 {
                break;
            }

            let Some(parent) = page.parent() else {
                // This is the root. It stays, even if empty.
                break;
            };

            self.pages.release(page_id);
            page_id = parent;
        }
    }

    /// Unlinks the element at `id` without dropping it. Used when its value is not valid.
    #[cfg_attr(test, mutants::skip)] // Only reachable via panics in caller code.
    fn discard(&mut self, id: u32) {
        if let Some((leaf, element)) = self.locate(id) {
            self.detach(leaf, id, element);
        }
    }

    /// Drops every element linked from `pages` and releases its storage.
    ///
    /// `pages` must already be detached from the tree. If a destructor panics, the remaining
    /// elements are dropped during unwinding. Every block goes back to `elements` either way.
    fn drop_detached(elements: &mut BlockPool, pages: &PageArena<T>) {
        let mut remaining = scopeguard::guard(
            (elements, pages.leaf_elements()),
            |(elements, rest)| {
                for element in rest {
                    // SAFETY: Same as below, this just finishes the job after a panic.
                    unsafe { Self::drop_and_release(elements, element) };
                }
            },
        );

        let (elements, rest) = &mut *remaining;

        for element in rest {
            // SAFETY: Each element is initialized while linked and linked exactly once, and the
            // pages linking to it are no longer reachable from the tree.
            unsafe { Self::drop_and_release(elements, element) };
        }
    }

    /// # Safety
    ///
    /// `element` must be an initialized element allocated from `elements` that nothing will
    /// access afterwards.
    unsafe fn drop_and_release(elements: &mut BlockPool, element: NonNull<T>) {
        // The block goes back to the pool even if the destructor panics.
        let _release = scopeguard::guard(elements, |elements| {
            // SAFETY: Forwarding guarantee from caller that the block came from this pool and
            // is not used again.
            unsafe { elements.release(element.cast()) };
        });

        // SAFETY: Forwarding guarantee from caller that the element is initialized and unused.
        unsafe { element.drop_in_place() };
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn integrity_check(&self) {
        let Some(root) = self.root else {
            assert_eq!(self.depth, 0, "tree without root must have zero depth");
            assert_eq!(self.count, 0, "tree without root must be empty");
            assert_eq!(self.pages.len(), 0, "tree without root must have no pages");
            return;
        };

        let root_page = self.pages.get(root);
        assert!(root_page.parent().is_none(), "root page must not have a parent");
        assert_eq!(
            root_page.lsb(),
            self.depth.saturating_sub(1).saturating_mul(self.fan_out_bits),
            "root page lsb must match tree depth"
        );

        let mut observed_pages: usize = 0;
        let mut observed_elements: usize = 0;
        let mut pending = vec![(root, 0_u32)];

        while let Some((page_id, prefix)) = pending.pop() {
            let page = self.pages.get(page_id);
            observed_pages = observed_pages.saturating_add(1);

            assert_eq!(
                page.occupied(),
                page.occupied_links().count(),
                "page occupancy must match its non-vacant links"
            );

            if page_id != root {
                assert!(page.occupied() > 0, "only the root page may be empty");
            }

            for (slot, link) in page.occupied_links() {
                let id = prefix | slot_bits(slot, page.lsb());

                match link {
                    Link::Element(element) => {
                        assert!(page.is_leaf(), "only leaf pages may link to elements");
                        assert!(
                            self.elements.owns(element.cast()),
                            "element {id} must live in the tree's element storage"
                        );
                        assert!(
                            u64::from(id) < self.next_id,
                            "element {id} must be below the next free id {}",
                            self.next_id
                        );
                        observed_elements = observed_elements.saturating_add(1);
                    }
                    Link::Page(child) => {
                        assert!(!page.is_leaf(), "leaf pages must not link to pages");

                        let child_page = self.pages.get(child);
                        assert_eq!(
                            child_page.parent(),
                            Some(page_id),
                            "child page must link back to its parent"
                        );
                        assert_eq!(
                            child_page.lsb(),
                            page.child_lsb(),
                            "child page must be exactly one level below its parent"
                        );

                        pending.push((child, id));
                    }
                    Link::Vacant => unreachable!("occupied_links() never yields vacant links"),
                }
            }
        }

        assert_eq!(observed_pages, self.pages.len(), "every page must be reachable");
        assert_eq!(observed_elements, self.count, "element count must match leaf links");
        assert_eq!(
            self.elements.len(),
            self.count,
            "element storage must hold exactly the linked elements"
        );
    }
}

impl<T> Default for IdTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for IdTree<T> {
    /// # Panics
    ///
    /// Panics if element storage for the copy cannot be allocated, even if the allocation policy
    /// would otherwise report this as an error. Use [`IdTree::copy_with()`] to handle that.
    fn clone(&self) -> Self {
        self.copy_with(|_, value| value.clone())
            .expect("we do not intend to handle allocation failure as a real possibility when cloning - OOM is panic")
    }
}

impl<T> fmt::Debug for IdTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdTree")
            .field("item_type", &format_args!("{}", type_name::<T>()))
            .field("len", &self.count)
            .field("depth", &self.depth)
            .field("page_count", &self.pages.len())
            .field("next_id", &self.next_id)
            .field("fan_out_bits", &self.fan_out_bits)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for IdTree<T> {
    fn drop(&mut self) {
        let was_empty = self.is_empty();

        let pages = self.pages.take();
        self.count = 0;

        Self::drop_detached(&mut self.elements, &pages);

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if self.drop_policy == DropPolicy::MustNotDropItems && !thread::panicking() {
            assert!(
                was_empty,
                "dropped a non-empty tree of {} with a policy that says it must be empty when dropped",
                type_name::<T>()
            );
        }
    }
}

// SAFETY: The raw pointers in the pages only point into element storage owned by the tree, so as
// long as T itself can move between threads, the tree can do so, too.
unsafe impl<T: Send> Send for IdTree<T> {}

impl<'a, T> IntoIterator for &'a IdTree<T> {
    type Item = (u32, Pin<&'a T>);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
