//! Shared fixture for the end-to-end collector tests: a bootstrapped class
//! set, leaked root cells, and a hook that runs between the marking and
//! compaction pauses (where a real runtime would be mutating).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uffd_compact::object::{self, ElementKind, ObjectKind};
use uffd_compact::runtime::thread::MutatorThread;
use uffd_compact::runtime::RuntimeCallbacks;
use uffd_compact::util::constants::{BYTES_IN_PAGE, BYTES_IN_WORD};
use uffd_compact::{Address, MarkCompact, ObjectReference, Options};

pub const WORD: usize = BYTES_IN_WORD;
pub const PAGE: usize = BYTES_IN_PAGE;

/// Node instances: class word, reference field (word 1), tag word (word 2).
pub const NODE_SIZE: usize = 3 * WORD;
pub const NODE_REF_WORD: usize = 1;
pub const NODE_TAG_WORD: usize = 2;

#[derive(Default)]
pub struct Hooks {
    /// Invoked while cache sweeping runs, i.e. after the marking pause and
    /// before the compaction pause.
    pub between_pauses: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl RuntimeCallbacks for Hooks {
    fn sweep_caches(&self) {
        if let Some(f) = self.between_pauses.lock().unwrap().as_mut() {
            f();
        }
    }
}

pub struct TestRuntime {
    pub gc: Arc<MarkCompact<Hooks>>,
    pub thread: Arc<MutatorThread>,
    pub meta: ObjectReference,
    pub node: ObjectReference,
    pub ref_array: ObjectReference,
    pub string: ObjectReference,
    pub weak: ObjectReference,
}

impl TestRuntime {
    /// A runtime pinned to the stop-the-world fallback; runs on any kernel.
    pub fn new_stw() -> TestRuntime {
        let mut options = Options::default();
        options.fallback_stw.set(true);
        Self::with_options(options)
    }

    pub fn with_options(mut options: Options) -> TestRuntime {
        options.moving_space_size.set(4 * 1024 * 1024);
        options.non_moving_space_size.set(1024 * 1024);
        let gc = Arc::new(MarkCompact::new(options, Hooks::default()).unwrap());
        let thread = gc.attach_thread();

        // Classes live in the non-moving space unless a test says otherwise.
        let meta = Self::class_in_non_moving(
            &gc,
            ObjectReference::NULL,
            ObjectKind::Class,
            object::CLASS_BYTES,
            ElementKind::Primitive { log_bytes: 0 },
            object::CLASS_REF_MAP,
        );
        let node = Self::class_in_non_moving(
            &gc,
            meta,
            ObjectKind::Instance,
            NODE_SIZE,
            ElementKind::Primitive { log_bytes: 0 },
            1 << NODE_REF_WORD,
        );
        let ref_array = Self::class_in_non_moving(
            &gc,
            meta,
            ObjectKind::Array,
            0,
            ElementKind::Reference,
            0,
        );
        let string = Self::class_in_non_moving(
            &gc,
            meta,
            ObjectKind::String,
            0,
            ElementKind::Primitive { log_bytes: 0 },
            0,
        );
        let weak = Self::class_in_non_moving(
            &gc,
            meta,
            ObjectKind::Reference,
            2 * WORD,
            ElementKind::Primitive { log_bytes: 0 },
            1 << object::REFERENT_WORD,
        );

        TestRuntime {
            gc,
            thread,
            meta,
            node,
            ref_array,
            string,
            weak,
        }
    }

    fn class_in_non_moving(
        gc: &MarkCompact<Hooks>,
        meta: ObjectReference,
        kind: ObjectKind,
        instance_size: usize,
        elem: ElementKind,
        ref_map: usize,
    ) -> ObjectReference {
        let at = gc.alloc_non_moving(object::CLASS_BYTES).unwrap();
        let class = object::format_class(
            at,
            meta,
            kind,
            instance_size,
            elem,
            ref_map,
            ObjectReference::NULL,
        );
        gc.publish_non_moving(class);
        class
    }

    /// Allocate a node in the moving space with the given tag.
    pub fn new_node(&self, tag: usize) -> ObjectReference {
        let at = self.gc.alloc_moving_shared(NODE_SIZE).unwrap();
        let o = object::format_instance(at, self.node);
        unsafe { (at + NODE_TAG_WORD * WORD).store::<usize>(tag) };
        o
    }

    pub fn new_string(&self, text: &str) -> ObjectReference {
        let size = object::STRING_HEADER_BYTES + text.len();
        let at = self
            .gc
            .alloc_moving_shared((size + WORD - 1) & !(WORD - 1))
            .unwrap();
        let o = object::format_string(at, self.string, text.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                text.as_ptr(),
                (at + object::STRING_HEADER_BYTES).to_mut_ptr::<u8>(),
                text.len(),
            )
        };
        o
    }

    pub fn string_content(&self, o: ObjectReference) -> String {
        let len = object::length_of(o.to_address());
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (o.to_address() + object::STRING_HEADER_BYTES).to_ptr::<u8>(),
                len,
            )
        };
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    pub fn tag_of(&self, o: ObjectReference) -> usize {
        unsafe { (o.to_address() + NODE_TAG_WORD * WORD).load::<usize>() }
    }

    pub fn field_of(&self, o: ObjectReference, word: usize) -> ObjectReference {
        object::read_ref_field(o, word)
    }

    /// Register a leaked root cell holding `o` and return it; the collector
    /// rewrites the cell in place during the compaction pause.
    pub fn root(&self, o: ObjectReference) -> &'static AtomicUsize {
        let cell: &'static AtomicUsize =
            Box::leak(Box::new(AtomicUsize::new(o.to_address().as_usize())));
        self.thread
            .add_root(Address::from_ptr(cell as *const AtomicUsize));
        cell
    }

    pub fn read_root(&self, cell: &AtomicUsize) -> ObjectReference {
        ObjectReference::from_address(unsafe {
            Address::from_usize(cell.load(Ordering::Acquire))
        })
    }

    pub fn moving_begin(&self) -> Address {
        self.gc.heap().moving.begin()
    }
}
