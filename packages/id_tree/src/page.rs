use std::any::type_name;
use std::fmt;
use std::mem;
use std::ops::Range;
use std::ptr::NonNull;

/// Handle of a page in a [`PageArena`]. Stable for as long as the page is allocated.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct PageId(usize);

/// One slot of a page. Leaf pages only hold element links, internal pages only hold page links.
pub(crate) enum Link<T> {
    Vacant,
    Page(PageId),
    Element(NonNull<T>),
}

// Manual impls because derive would require T: Copy, which a pointer to T does not need.
impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Link<T> {}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vacant => write!(f, "Vacant"),
            Self::Page(page) => f.debug_tuple("Page").field(page).finish(),
            Self::Element(ptr) => f.debug_tuple("Element").field(ptr).finish(),
        }
    }
}

impl<T> Link<T> {
    #[must_use]
    pub(crate) fn is_vacant(&self) -> bool {
        matches!(self, Self::Vacant)
    }
}

/// Bookkeeping of one page. Its `1 << fan_out_bits` links live in the arena's shared link storage.
#[derive(Debug)]
struct Header {
    /// Index of the least significant ID bit used to pick a slot in this page. Constant once
    /// the page is created. Zero for leaf pages.
    lsb: u32,

    fan_out_bits: u32,

    /// Number of non-vacant links.
    occupied: usize,

    /// `None` only for the root page.
    parent: Option<PageId>,
}

impl Header {
    fn child_lsb(&self) -> u32 {
        self.lsb
            .checked_sub(self.fan_out_bits)
            .expect("leaf pages have no child pages")
    }

    fn slot_for(&self, id: u32) -> usize {
        crate::slot_index(id, self.lsb, self.fan_out_bits)
    }
}

/// Shared view of one page: its header and its links.
pub(crate) struct Page<'a, T> {
    header: &'a Header,
    links: &'a [Link<T>],
}

// Manual impls because derive would require T: Copy.
impl<T> Clone for Page<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Page<'_, T> {}

impl<T> fmt::Debug for Page<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("lsb", &self.header.lsb)
            .field("occupied", &self.header.occupied)
            .field("parent", &self.header.parent)
            .finish_non_exhaustive()
    }
}

impl<'a, T> Page<'a, T> {
    #[must_use]
    pub(crate) fn lsb(self) -> u32 {
        self.header.lsb
    }

    #[must_use]
    pub(crate) fn is_leaf(self) -> bool {
        self.header.lsb == 0
    }

    #[must_use]
    pub(crate) fn occupied(self) -> usize {
        self.header.occupied
    }

    #[must_use]
    pub(crate) fn parent(self) -> Option<PageId> {
        self.header.parent
    }

    /// The least significant bit indexed by this page's children.
    ///
    /// # Panics
    ///
    /// Panics if called on a leaf page.
    #[must_use]
    pub(crate) fn child_lsb(self) -> u32 {
        self.header.child_lsb()
    }

    /// The slot that `id` occupies in this page.
    #[must_use]
    pub(crate) fn slot_for(self, id: u32) -> usize {
        self.header.slot_for(id)
    }

    #[must_use]
    pub(crate) fn link(self, slot: usize) -> Link<T> {
        *self
            .links
            .get(slot)
            .expect("slot indexes are masked to the page width")
    }

    /// The first non-vacant slot at index `start` or above, with its link.
    #[must_use]
    pub(crate) fn occupied_from(self, start: usize) -> Option<(usize, Link<T>)> {
        self.links
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, link)| !link.is_vacant())
            .map(|(slot, link)| (slot, *link))
    }

    /// All non-vacant slots with their links, in ascending slot order.
    pub(crate) fn occupied_links(self) -> impl Iterator<Item = (usize, Link<T>)> + 'a {
        self.links
            .iter()
            .enumerate()
            .filter(|(_, link)| !link.is_vacant())
            .map(|(slot, link)| (slot, *link))
    }
}

/// Exclusive view of one page, for changing its links and parent.
pub(crate) struct PageMut<'a, T> {
    header: &'a mut Header,
    links: &'a mut [Link<T>],
}

impl<T> PageMut<'_, T> {
    #[must_use]
    pub(crate) fn occupied(&self) -> usize {
        self.header.occupied
    }

    #[must_use]
    pub(crate) fn parent(&self) -> Option<PageId> {
        self.header.parent
    }

    pub(crate) fn set_parent(&mut self, parent: Option<PageId>) {
        self.header.parent = parent;
    }

    #[must_use]
    pub(crate) fn slot_for(&self, id: u32) -> usize {
        self.header.slot_for(id)
    }

    /// Stores a link in a vacant slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already occupied.
    pub(crate) fn occupy(&mut self, slot: usize, link: Link<T>) {
        debug_assert!(!link.is_vacant(), "occupying a slot with a vacant link");

        let entry = self
            .links
            .get_mut(slot)
            .expect("slot indexes are masked to the page width");

        assert!(
            entry.is_vacant(),
            "slot {slot} of page at lsb {} was already occupied in tree of {}",
            self.header.lsb,
            type_name::<T>()
        );

        *entry = link;

        self.header.occupied = self
            .header
            .occupied
            .checked_add(1)
            .expect("occupied count is bounded by the page width");
    }

    /// Clears an occupied slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already vacant.
    pub(crate) fn vacate(&mut self, slot: usize) {
        let entry = self
            .links
            .get_mut(slot)
            .expect("slot indexes are masked to the page width");

        assert!(
            !entry.is_vacant(),
            "slot {slot} of page at lsb {} was already vacant in tree of {}",
            self.header.lsb,
            type_name::<T>()
        );

        *entry = Link::Vacant;

        self.header.occupied = self
            .header
            .occupied
            .checked_sub(1)
            .expect("we asserted above that the slot is occupied so count must be non-zero");
    }
}

/// Backing storage for the pages of one tree.
///
/// Pages are addressed by [`PageId`] handles rather than pointers, so parent links are plain
/// values. The links of all pages share one buffer, page `n` owning the `n`th run of
/// `1 << fan_out_bits` links, so creating a page does not allocate once the buffer has room.
/// Released entries are kept on an intrusive free list and reused before the arena grows.
#[derive(Debug)]
pub(crate) struct PageArena<T> {
    entries: Vec<Entry>,

    links: Vec<Link<T>>,

    /// Index of the most recently released entry, pointing one past the end if none are vacant.
    next_free_index: usize,

    /// Number of allocated pages.
    count: usize,

    fan_out_bits: u32,

    /// Links per page.
    width: usize,
}

#[derive(Debug)]
enum Entry {
    Occupied { header: Header },

    Vacant { next_free_index: usize },
}

impl<T> PageArena<T> {
    #[must_use]
    pub(crate) fn new(fan_out_bits: u32) -> Self {
        let width = 1_usize
            .checked_shl(fan_out_bits)
            .expect("fan-out bits are validated to be small when the tree is built");

        Self {
            entries: Vec::new(),
            links: Vec::new(),
            next_free_index: 0,
            count: 0,
            fan_out_bits,
            width,
        }
    }

    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Allocates an empty page.
    pub(crate) fn allocate(&mut self, lsb: u32, parent: Option<PageId>) -> PageId {
        let header = Header {
            lsb,
            fan_out_bits: self.fan_out_bits,
            occupied: 0,
            parent,
        };
        let index = self.next_free_index;

        match self.entries.get_mut(index) {
            Some(entry) => {
                let previous = mem::replace(entry, Entry::Occupied { header });

                self.next_free_index = match previous {
                    Entry::Vacant { next_free_index } => next_free_index,
                    Entry::Occupied { .. } => panic!(
                        "page entry {index} on the free list was occupied in tree of {}",
                        type_name::<T>()
                    ),
                };

                // Pages are only released once empty, so the reused links are all vacant.
                debug_assert!(
                    self.links
                        .get(self.link_range(index))
                        .is_some_and(|links| links.iter().all(Link::is_vacant)),
                    "reused page entry {index} still had links"
                );
            }
            None => {
                let links_end = self.link_range(index).end;

                self.entries.push(Entry::Occupied { header });
                self.links.resize_with(links_end, || Link::Vacant);
                self.next_free_index = self.entries.len();
            }
        }

        self.count = self
            .count
            .checked_add(1)
            .expect("page count cannot exceed virtual memory");

        PageId(index)
    }

    /// Releases a page, making its handle invalid.
    ///
    /// # Panics
    ///
    /// Panics if the page is not allocated.
    pub(crate) fn release(&mut self, id: PageId) {
        let next_free_index = self.next_free_index;

        let entry = self
            .entries
            .get_mut(id.0)
            .expect("page handles always point inside the arena");

        assert!(
            matches!(entry, Entry::Occupied { .. }),
            "released vacant page {} in tree of {}",
            id.0,
            type_name::<T>()
        );

        *entry = Entry::Vacant { next_free_index };
        self.next_free_index = id.0;

        self.count = self
            .count
            .checked_sub(1)
            .expect("we asserted above that the entry is occupied so count must be non-zero");
    }

    /// # Panics
    ///
    /// Panics if the page is not allocated.
    #[must_use]
    pub(crate) fn get(&self, id: PageId) -> Page<'_, T> {
        let Some(Entry::Occupied { header }) = self.entries.get(id.0) else {
            panic!(
                "page {} is not allocated in tree of {}",
                id.0,
                type_name::<T>()
            );
        };

        let links = self
            .links
            .get(self.link_range(id.0))
            .expect("every entry has its run of links");

        Page { header, links }
    }

    /// # Panics
    ///
    /// Panics if the page is not allocated.
    #[must_use]
    pub(crate) fn get_mut(&mut self, id: PageId) -> PageMut<'_, T> {
        let range = self.link_range(id.0);

        let Some(Entry::Occupied { header }) = self.entries.get_mut(id.0) else {
            panic!(
                "page {} is not allocated in tree of {}",
                id.0,
                type_name::<T>()
            );
        };

        let links = self
            .links
            .get_mut(range)
            .expect("every entry has its run of links");

        PageMut { header, links }
    }

    /// Every element linked from a leaf page, in arena order.
    ///
    /// # Panics
    ///
    /// Panics if a leaf page links to something other than an element.
    pub(crate) fn leaf_elements(&self) -> impl Iterator<Item = NonNull<T>> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                matches!(entry, Entry::Occupied { header } if header.lsb == 0)
            })
            .flat_map(|(index, _)| {
                self.links
                    .get(self.link_range(index))
                    .expect("every entry has its run of links")
            })
            .filter_map(|link| match link {
                Link::Vacant => None,
                Link::Element(element) => Some(*element),
                Link::Page(_) => panic!(
                    "leaf page linked to something other than an element in tree of {}",
                    type_name::<T>()
                ),
            })
    }

    /// Empties this arena, handing its former contents to the caller.
    #[must_use]
    pub(crate) fn take(&mut self) -> Self {
        let empty = Self::new(self.fan_out_bits);
        mem::replace(self, empty)
    }

    fn link_range(&self, index: usize) -> Range<usize> {
        let start = index
            .checked_mul(self.width)
            .expect("link storage cannot exceed virtual memory");
        let end = start
            .checked_add(self.width)
            .expect("link storage cannot exceed virtual memory");

        start..end
    }
}
