//! Integration tests for the `id_tree` package.
//!
//! These use the tree the way a handle table would: IDs picked by the caller or handed out by
//! `append()`, pointers held on to across unrelated mutations, and IDs that grow far apart.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};

use id_tree::{AllocationPolicy, BuildError, DropPolicy, Error, IdTree};

#[test]
fn handle_table_lifecycle() {
    let mut tree = IdTree::<&str>::new();

    for (id, value) in [(3, "A"), (18, "B"), (11, "C"), (22, "D")] {
        tree.set(id, value).unwrap();
    }

    assert_eq!(tree.len(), 4);
    assert_eq!(tree.ids().collect::<Vec<_>>(), vec![3, 11, 18, 22]);

    let d_before = tree.get_ptr(22).unwrap();

    assert_eq!(tree.remove(18), Some("B"));

    assert_eq!(tree.len(), 3);
    assert_eq!(tree.ids().collect::<Vec<_>>(), vec![3, 11, 22]);
    assert!(tree.get(18).is_none());
    assert_eq!(*tree.get(22).unwrap(), "D");
    assert_eq!(tree.get_ptr(22), Some(d_before));
}

#[test]
fn depth_grows_under_existing_elements() {
    let mut tree = IdTree::<u64>::with_fan_out_bits(8).unwrap();

    tree.set(0, 0xdead).unwrap();
    let zero_before = tree.get_ptr(0).unwrap();
    assert_eq!(tree.depth(), 1);

    tree.set(300, 0xbeef).unwrap();

    assert_eq!(tree.depth(), 2);
    assert_eq!(*tree.get(0).unwrap(), 0xdead);
    assert_eq!(tree.get_ptr(0), Some(zero_before));
    assert_eq!(*tree.get(300).unwrap(), 0xbeef);
}

#[test]
fn append_continues_after_largest_id_ever_used() {
    let mut tree = IdTree::<u32>::new();

    assert_eq!(tree.append(0).unwrap().0, 0);

    tree.set(41, 1).unwrap();
    assert_eq!(tree.append(2).unwrap().0, 42);

    tree.remove(42);
    tree.remove(41);
    assert_eq!(tree.append(3).unwrap().0, 43);

    // SAFETY: The closure fully initializes the element.
    let (id, value) = unsafe {
        tree.append_with(|uninit| {
            uninit.write(4);
        })
    }
    .unwrap();
    assert_eq!(id, 44);
    assert_eq!(*value, 4);
}

#[test]
fn append_after_max_id_fails_cleanly() {
    let mut tree = IdTree::<u32>::builder()
        .large_id_warning(None)
        .build()
        .unwrap();

    tree.set(u32::MAX, 1).unwrap();

    let error = tree.append(2).unwrap_err();

    assert_eq!(error, Error::IdSpaceExhausted);
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.ids().collect::<Vec<_>>(), vec![u32::MAX]);
}

#[test]
fn pointers_survive_heavy_churn() {
    let mut tree = IdTree::<[u64; 3]>::with_fan_out_bits(4).unwrap();

    let anchors = [0_u32, 7, 1000, 65_535];
    for id in anchors {
        tree.set(id, [u64::from(id); 3]).unwrap();
    }

    let pointers: Vec<NonNull<[u64; 3]>> =
        anchors.iter().map(|id| tree.get_ptr(*id).unwrap()).collect();

    for round in 0..1000_u32 {
        let id = round.wrapping_mul(2_654_435_761) % 1_000_000;
        if anchors.contains(&id) {
            continue;
        }

        tree.set(id, [0; 3]).unwrap();

        if round % 3 != 0 {
            tree.remove(id);
        }
    }

    for (id, pointer) in anchors.iter().zip(pointers) {
        assert_eq!(tree.get_ptr(*id), Some(pointer));

        // SAFETY: The ID is still present, so the pointer is valid, and we hold no reference.
        assert_eq!(unsafe { pointer.read() }, [u64::from(*id); 3]);
    }
}

#[test]
fn removing_everything_leaves_only_root() {
    let mut tree = IdTree::<String>::with_fan_out_bits(3).unwrap();

    let ids = [5, 64, 65, 512, 9999, 123_456];
    for id in ids {
        tree.set(id, id.to_string()).unwrap();
    }

    assert!(tree.page_count() > 1);

    for id in ids {
        assert_eq!(tree.remove(id), Some(id.to_string()));
    }

    assert!(tree.is_empty());
    assert_eq!(tree.page_count(), 1);
    assert_eq!(tree.first(), None);
}

#[test]
fn copy_has_same_associations() {
    let mut tree = IdTree::<u32>::new();

    for id in [2, 3, 5, 7, 11, 13, 4096] {
        tree.set(id, id * id).unwrap();
    }

    let copy = tree.clone();
    let doubled = tree.copy_with(|_, value| value * 2).unwrap();

    assert_eq!(copy.len(), tree.len());
    assert_eq!(doubled.len(), tree.len());

    for (id, value) in &tree {
        assert_eq!(*copy.get(id).unwrap(), *value);
        assert_eq!(*doubled.get(id).unwrap(), *value * 2);
        assert!(!ptr::eq(copy.get(id).unwrap().get_ref(), value.get_ref()));
    }
}

#[test]
fn moves_between_threads() {
    let mut tree = IdTree::<String>::new();
    tree.set(9, "sent".to_string()).unwrap();

    let tree = std::thread::spawn(move || {
        tree.set(10, "returned".to_string()).unwrap();
        tree
    })
    .join()
    .unwrap();

    assert_eq!(tree.len(), 2);
}

#[test]
fn reporting_policies_build() {
    for policy in [AllocationPolicy::ReturnNone, AllocationPolicy::WarnAndReturnNone] {
        let mut tree = IdTree::<u8>::builder()
            .allocation_policy(policy)
            .drop_policy(DropPolicy::MustNotDropItems)
            .build()
            .unwrap();

        tree.reserve(100).unwrap();
        tree.set(1, 1).unwrap();
        tree.clear();
    }
}

/// An element no allocator can ever provide storage for.
type Huge = [u8; 1 << 45];

fn tree_of_huge(policy: AllocationPolicy) -> IdTree<Huge> {
    IdTree::<Huge>::builder()
        .allocation_policy(policy)
        .build()
        .unwrap()
}

#[test]
#[cfg_attr(miri, ignore)] // Miri does not emulate the operating system refusing huge allocations.
fn failed_element_allocation_leaves_tree_unchanged() {
    let mut tree = tree_of_huge(AllocationPolicy::ReturnNone);

    // SAFETY: The initializer is never called because there is no storage to initialize.
    let result = unsafe { tree.set_with(5, |_| unreachable!("no storage was allocated")) };
    assert!(matches!(result, Err(Error::Allocation(_))));

    assert!(tree.is_empty());
    assert!(!tree.contains(5));
    assert_eq!(tree.depth(), 0);
    assert_eq!(tree.page_count(), 0);
    assert_eq!(tree.next_id(), 0);

    // SAFETY: As above.
    let result = unsafe { tree.append_with(|_| unreachable!("no storage was allocated")) };
    assert!(matches!(result, Err(Error::Allocation(_))));

    assert!(tree.is_empty());
    assert_eq!(tree.page_count(), 0);
    assert_eq!(tree.next_id(), 0);
}

#[test]
fn invalid_configuration_is_rejected() {
    assert_eq!(
        IdTree::<u32>::with_fan_out_bits(0).unwrap_err(),
        BuildError::FanOutBitsOutOfRange { bits: 0 }
    );
    assert_eq!(
        IdTree::<()>::builder().build().unwrap_err(),
        BuildError::ZeroSizedElement
    );
}

/// Collects formatted `tracing` output so tests can look at it.
#[derive(Clone, Default)]
struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn with_captured_tracing(f: impl FnOnce()) -> String {
    let output = CapturedOutput::default();

    let writer = output.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, f);

    output.text()
}

#[test]
fn large_id_is_reported() {
    let output = with_captured_tracing(|| {
        let mut tree = IdTree::<u32>::builder()
            .large_id_warning(Some(1000))
            .build()
            .unwrap();

        tree.set(999, 1).unwrap();
        tree.set(1000, 2).unwrap();

        // The warning changes nothing about the outcome.
        assert_eq!(tree.len(), 2);
    });

    assert_eq!(output.matches("inserting unusually large id").count(), 1);
}

#[test]
fn large_id_warning_can_be_disabled() {
    let output = with_captured_tracing(|| {
        let mut tree = IdTree::<u32>::builder()
            .large_id_warning(None)
            .build()
            .unwrap();

        tree.set(u32::MAX, 1).unwrap();
    });

    assert!(!output.contains("inserting unusually large id"));
    assert!(output.contains("id tree grew in depth"));
}

#[test]
#[cfg_attr(miri, ignore)] // Miri does not emulate the operating system refusing huge allocations.
fn failed_element_allocation_is_reported() {
    let output = with_captured_tracing(|| {
        let mut tree = tree_of_huge(AllocationPolicy::WarnAndReturnNone);

        // SAFETY: The initializer is never called because there is no storage to initialize.
        let result = unsafe { tree.set_with(1, |_| unreachable!("no storage was allocated")) };
        assert!(matches!(result, Err(Error::Allocation(_))));

        assert!(tree.is_empty());
        assert_eq!(tree.page_count(), 0);
        assert_eq!(tree.next_id(), 0);
    });

    assert!(output.contains("block pool failed to allocate a new chunk"));
}
