//! Stable handles for debugger objects.
//!
//! A handle is keyed by its v-path: the local ids from a root scope down to the node, e.g.
//! `["[11,0]", "[locs]", "point", "x"]`. After [`HandleTree::reset`] the same v-path gets the
//! same handle again, so the client keeps its tree expansion state across stops.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

pub type Handle = i64;

/// First handle value handed out in a session.
pub const FIRST_HANDLE: Handle = 1000;

/// Monotonic counter shared by every handle consumer of a session.
#[derive(Clone, Debug)]
pub struct HandleAllocator(Rc<Cell<Handle>>);

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new(FIRST_HANDLE)
    }
}

impl HandleAllocator {
    pub fn new(first: Handle) -> Self {
        Self(Rc::new(Cell::new(first)))
    }

    pub fn next(&self) -> Handle {
        let handle = self.0.get();
        self.0.set(handle + 1);
        handle
    }
}

type VPath = Rc<[String]>;

pub struct HandleTree<T> {
    allocator: HandleAllocator,
    objects: HashMap<Handle, (VPath, T)>,
    by_vpath: HashMap<VPath, Handle>,
    prev_by_vpath: HashMap<VPath, Handle>,
}

impl<T> HandleTree<T> {
    pub fn new(allocator: HandleAllocator) -> Self {
        Self {
            allocator,
            objects: HashMap::new(),
            by_vpath: HashMap::new(),
            prev_by_vpath: HashMap::new(),
        }
    }

    /// Register `value` under `key` below `parent` (a root if `None` or unknown).
    pub fn create(&mut self, value: T, key: &str, parent: Option<Handle>) -> Handle {
        let mut vpath: Vec<String> = parent
            .and_then(|p| self.objects.get(&p))
            .map(|(vpath, _)| vpath.to_vec())
            .unwrap_or_default();
        vpath.push(key.to_string());
        let vpath: VPath = vpath.into();

        let handle = match self.by_vpath.get(&vpath) {
            Some(handle) => *handle,
            None => {
                let handle = match self.prev_by_vpath.get(&vpath) {
                    Some(handle) => *handle,
                    None => self.allocator.next(),
                };
                self.by_vpath.insert(vpath.clone(), handle);
                handle
            }
        };
        self.objects.insert(handle, (vpath, value));
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.objects.get(&handle).map(|(_, value)| value)
    }

    pub fn vpath(&self, handle: Handle) -> Option<&[String]> {
        self.objects.get(&handle).map(|(vpath, _)| vpath.as_ref())
    }

    /// Start a new generation, every live handle becomes stale.
    pub fn reset(&mut self) {
        self.prev_by_vpath = std::mem::take(&mut self.by_vpath);
        self.objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
