use crate::bitstream::BitStream;
use crate::ghost::ScopeQuery;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Shared handle to a ghostable object. The engine never owns application objects;
/// ghost records hold weak references and detach when the application drops its last
/// strong handle.
pub type NetObjectHandle = Rc<RefCell<dyn NetObject>>;
pub type NetObjectRef = Weak<RefCell<dyn NetObject>>;

/// Identity key for an object handle, used by ghost lookup tables and the dirty list.
#[inline]
pub fn object_key(handle: &NetObjectHandle) -> usize {
    Rc::as_ptr(handle) as *const () as usize
}

/// A server-side object whose state can be replicated ("ghosted") to clients.
///
/// Each object exposes up to 32 independent dirty states through its update mask.
/// `pack_update` writes the states selected by the mask and returns the residual mask
/// of states it could not fit; `unpack_update` must read symmetrically on the client.
pub trait NetObject {
    fn class_name(&self) -> &'static str;

    /// Writes the masked states into the stream and returns the mask bits that still
    /// need transmission (0 when everything fit).
    fn pack_update(&mut self, mask: u32, stream: &mut BitStream) -> u32;

    /// Reads the state written by `pack_update`. `initial_update` is true for the
    /// packet that constructed this ghost, allowing one-time fields.
    fn unpack_update(&mut self, stream: &mut BitStream, initial_update: bool);

    /// Called on the client after construction and the initial update. Returning
    /// false aborts the connection.
    fn on_ghost_add(&mut self) -> bool {
        true
    }

    /// Called on the client before the ghost is destroyed.
    fn on_ghost_remove(&mut self) {}

    /// Called on the server once the ghost is known to exist and be addressable on
    /// the client.
    fn on_ghost_available(&mut self) {}

    /// Relative update priority, queried against the connection's scope object so
    /// implementations can rank by relevance (e.g. distance from the camera or
    /// avatar). The default lets stale objects float upward as their skip count
    /// grows. Compare with `Rc::ptr_eq` before borrowing `scope_object`; the object
    /// being prioritized may itself be the scope object.
    fn update_priority(
        &self,
        _scope_object: &NetObjectHandle,
        _mask: u32,
        update_skips: u32,
    ) -> f32 {
        update_skips as f32 * 0.1
    }

    /// For a scope object: mark every object visible to this connection by calling
    /// `query.object_in_scope`.
    fn perform_scope_query(&self, _query: &mut ScopeQuery) {}
}

/// Dirty-mask accumulator held by the interface. Applications mark changed objects
/// once; the masks are collapsed into every scoping connection at the top of the next
/// tick, so a burst of changes costs one table walk.
pub struct DirtyList {
    entries: HashMap<usize, (NetObjectRef, u32)>,
}

impl DirtyList {
    pub fn new() -> DirtyList {
        DirtyList {
            entries: HashMap::new(),
        }
    }

    pub fn mark(&mut self, object: &NetObjectHandle, mask: u32) {
        debug_assert!(mask != 0);
        let key = object_key(object);
        let slot = self
            .entries
            .entry(key)
            .or_insert_with(|| (Rc::downgrade(object), 0));
        slot.1 |= mask;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains the accumulated (object identity, mask) pairs.
    pub fn take(&mut self) -> Vec<(usize, u32)> {
        self.entries
            .drain()
            .map(|(key, (_, mask))| (key, mask))
            .collect()
    }
}
