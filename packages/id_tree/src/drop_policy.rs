/// Determines element dropping behavior when the tree is dropped.
///
/// By default, the tree will drop its elements when it is dropped.
///
/// # Examples
///
/// ```
/// use id_tree::{DropPolicy, IdTree};
///
/// // The drop policy is set at tree creation time.
/// let tree = IdTree::<u32>::builder()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The tree will drop its elements when the tree is dropped. This is the default.
    #[default]
    MayDropItems,

    /// The tree will panic if it still contains elements when it is dropped.
    ///
    /// This may be valuable if unsafe code holds out of band pointers to elements (obtained via
    /// [`IdTree::get_ptr()`][crate::IdTree::get_ptr]) that must be released before the elements
    /// can go away.
    MustNotDropItems,
}
