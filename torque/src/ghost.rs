use crate::bitstream::BitStream;
use crate::connection::{ConnectionState, NetConnection, PacketNotify};
use crate::event::{
    EventConnection, EventDirection, GuaranteeType, NetEvent, BIT_STREAM_POS_BIT_SIZE,
    DEBUG_CHECKSUM,
};
use crate::object::{object_key, NetObjectHandle, NetObjectRef};
use crate::registry::{ClassRegistry, ClassRegistryBuilder, ClassType};
use crate::stringtable::{StringTableRead, StringTableWrite};
use crate::support::constants::{MAX_GHOST_COUNT, MINIMUM_PADDING_BITS};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use quark::logging::{self, Logger};
use std::collections::VecDeque;
use std::rc::Rc;

// GhostRecord flag bits
const IN_SCOPE: u32 = 1 << 0;
const SCOPE_LOCAL_ALWAYS: u32 = 1 << 1;
const NOT_YET_GHOSTED: u32 = 1 << 2;
const GHOSTING: u32 = 1 << 3;
const KILL_GHOST: u32 = 1 << 4;
const KILLING_GHOST: u32 = 1 << 5;
/// If any of these are set the ghost is not yet addressable by id lookups.
const NOT_AVAILABLE: u32 = NOT_YET_GHOSTED | GHOSTING | KILL_GHOST | KILLING_GHOST;

const GHOST_LOOKUP_TABLE_SIZE: usize = 1024;
const GHOST_LOOKUP_TABLE_MASK: usize = GHOST_LOOKUP_TABLE_SIZE - 1;
const KILL_PRIORITY: f32 = 10_000.0;

/// Record of one ghost update written into one packet: the mask bits covered, a
/// snapshot of the lifecycle flags, and the slab id of the ghost.
pub struct GhostRef {
    pub index: u16,
    pub mask: u32,
    pub flags: u32,
}

/// Lifecycle notices surfaced to the application through the interface event drain.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GhostNotice {
    GhostingStarted,
    GhostingStopped,
}

/// Per-(connection, object) replication state. Slab-allocated; the slab index is the
/// wire-level ghost id.
struct GhostRecord {
    obj: Option<NetObjectRef>,
    obj_key: usize,
    update_mask: u32,
    flags: u32,
    priority: f32,
    update_skip_count: u32,
    array_index: usize,
    next_lookup: Option<u16>,
    /// Masks of this ghost's updates currently in flight, oldest first. Because
    /// delivery notifications arrive in send order, the front entry is always the one
    /// being resolved; on a drop, the bits no later flight still covers are re-dirtied.
    flight_masks: VecDeque<u32>,
}

impl GhostRecord {
    fn new(array_index: usize) -> GhostRecord {
        GhostRecord {
            obj: None,
            obj_key: 0,
            update_mask: 0,
            flags: 0,
            priority: 0.0,
            update_skip_count: 0,
            array_index,
            next_lookup: None,
            flight_masks: VecDeque::new(),
        }
    }
}

#[inline]
fn lookup_bucket(key: usize) -> usize {
    ((key >> 4) ^ (key >> 14) ^ (key >> 24)) & GHOST_LOOKUP_TABLE_MASK
}

/// Sender-side ghost bookkeeping: the three-range ghost array partition, the record
/// slab, and the object-identity lookup table.
///
/// `ghost_array` is partitioned as `[0, zero_update_index)` = ghosts with pending
/// mask bits, `[zero_update_index, free_index)` = ghosted and up to date,
/// `[free_index, MAX_GHOST_COUNT)` = free. All moves between ranges swap across a
/// boundary, preserving the partition.
pub(crate) struct GhostSender {
    ghost_array: Vec<u16>,
    records: Vec<GhostRecord>,
    zero_update_index: usize,
    free_index: usize,
    lookup: Vec<Option<u16>>,
    scoping: bool,
}

impl GhostSender {
    fn new() -> GhostSender {
        GhostSender {
            ghost_array: (0..MAX_GHOST_COUNT as u16).collect(),
            records: (0..MAX_GHOST_COUNT).map(GhostRecord::new).collect(),
            zero_update_index: 0,
            free_index: 0,
            lookup: vec![None; GHOST_LOOKUP_TABLE_SIZE],
            scoping: false,
        }
    }

    /// Restores the identity mapping; valid only when every record is free.
    fn reset_array(&mut self) {
        debug_assert!(self.zero_update_index == 0 && self.free_index == 0);
        for (position, slot) in self.ghost_array.iter_mut().enumerate() {
            *slot = position as u16;
            self.records[position].array_index = position;
        }
    }

    fn swap_positions(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let slab_a = self.ghost_array[a];
        let slab_b = self.ghost_array[b];
        self.ghost_array[a] = slab_b;
        self.ghost_array[b] = slab_a;
        self.records[slab_a as usize].array_index = b;
        self.records[slab_b as usize].array_index = a;
    }

    /// Moves a zero-mask ghost into the pending range.
    fn push_non_zero(&mut self, slab: u16) {
        let index = self.records[slab as usize].array_index;
        debug_assert!(index >= self.zero_update_index && index < self.free_index);
        self.swap_positions(index, self.zero_update_index);
        self.zero_update_index += 1;
    }

    /// Moves a pending ghost into the zero-mask range.
    fn push_to_zero(&mut self, slab: u16) {
        let index = self.records[slab as usize].array_index;
        debug_assert!(index < self.zero_update_index);
        self.zero_update_index -= 1;
        self.swap_positions(index, self.zero_update_index);
    }

    /// Moves a zero-mask ghost into the free range.
    fn push_zero_to_free(&mut self, slab: u16) {
        let index = self.records[slab as usize].array_index;
        debug_assert!(index >= self.zero_update_index && index < self.free_index);
        self.free_index -= 1;
        self.swap_positions(index, self.free_index);
    }

    /// Claims a free ghost record into the zero-mask range.
    fn push_free_to_zero(&mut self, slab: u16) {
        let index = self.records[slab as usize].array_index;
        debug_assert!(index >= self.free_index);
        self.swap_positions(index, self.free_index);
        self.free_index += 1;
    }

    fn lookup_find(&self, key: usize) -> Option<u16> {
        let mut walk = self.lookup[lookup_bucket(key)];
        while let Some(slab) = walk {
            if self.records[slab as usize].obj_key == key {
                return Some(slab);
            }
            walk = self.records[slab as usize].next_lookup;
        }
        None
    }

    fn lookup_insert(&mut self, slab: u16, key: usize) {
        let bucket = lookup_bucket(key);
        self.records[slab as usize].next_lookup = self.lookup[bucket];
        self.lookup[bucket] = Some(slab);
    }

    fn lookup_remove(&mut self, slab: u16, key: usize) {
        let bucket = lookup_bucket(key);
        let mut walk = self.lookup[bucket];
        if walk == Some(slab) {
            self.lookup[bucket] = self.records[slab as usize].next_lookup;
            return;
        }
        while let Some(current) = walk {
            let next = self.records[current as usize].next_lookup;
            if next == Some(slab) {
                self.records[current as usize].next_lookup =
                    self.records[slab as usize].next_lookup;
                return;
            }
            walk = next;
        }
    }

    /// Marks the ghost for deletion on the remote side and severs its object links.
    fn detach(&mut self, slab: u16) {
        let record = &mut self.records[slab as usize];
        record.flags |= KILL_GHOST;
        if record.update_mask == 0 {
            record.update_mask = !0;
            self.push_non_zero(slab);
        }
        let key = self.records[slab as usize].obj_key;
        if self.records[slab as usize].obj.is_some() {
            self.lookup_remove(slab, key);
            self.records[slab as usize].obj = None;
        }
    }

    /// Returns a fully resolved (acked-kill or cleared) record to the free range.
    fn free_record(&mut self, slab: u16) {
        let index = self.records[slab as usize].array_index;
        debug_assert!(index < self.free_index, "ghost already freed");
        if index < self.zero_update_index {
            self.records[slab as usize].update_mask = 0;
            self.push_to_zero(slab);
        }
        self.push_zero_to_free(slab);
        let record = &mut self.records[slab as usize];
        record.flags = 0;
        record.priority = 0.0;
        record.update_skip_count = 0;
        record.flight_masks.clear();
        if record.obj.is_some() {
            let key = record.obj_key;
            self.records[slab as usize].obj = None;
            self.lookup_remove(slab, key);
        }
    }

    fn mark_in_scope(&mut self, object: &NetObjectHandle) -> bool {
        let key = object_key(object);
        if let Some(slab) = self.lookup_find(key) {
            self.records[slab as usize].flags |= IN_SCOPE;
            return true;
        }
        if self.free_index == MAX_GHOST_COUNT {
            return false;
        }
        let slab = self.ghost_array[self.free_index];
        self.push_free_to_zero(slab);
        let record = &mut self.records[slab as usize];
        record.update_mask = !0;
        record.flags = NOT_YET_GHOSTED | IN_SCOPE;
        record.obj = Some(Rc::downgrade(object));
        record.obj_key = key;
        record.update_skip_count = 0;
        record.priority = 0.0;
        record.flight_masks.clear();
        self.push_non_zero(slab);
        self.lookup_insert(slab, key);
        true
    }
}

/// Handed to the scope object's `perform_scope_query`; visible objects are marked in
/// scope here, allocating ghost records for newcomers.
pub struct ScopeQuery<'a> {
    sender: &'a mut GhostSender,
    registry: &'a ClassRegistry,
    group: u32,
    ghost_class_count: u32,
}

impl<'a> ScopeQuery<'a> {
    /// Indicates the object is visible to this connection this tick.
    pub fn object_in_scope(&mut self, object: &NetObjectHandle) {
        if !self.sender.scoping {
            return;
        }
        // objects outside the negotiated class table cannot ghost on this connection
        let class_index = self
            .registry
            .object_index(self.group, object.borrow().class_name());
        match class_index {
            Some(index) if index < self.ghost_class_count => {}
            _ => return,
        }
        self.sender.mark_in_scope(object);
    }

    /// Marks the object permanently in scope for this connection; it survives scope
    /// queries that do not mention it.
    pub fn object_scope_always(&mut self, object: &NetObjectHandle) {
        self.object_in_scope(object);
        if let Some(slab) = self.sender.lookup_find(object_key(object)) {
            self.sender.records[slab as usize].flags |= SCOPE_LOCAL_ALWAYS;
        }
    }
}

/// Replicates scoped server objects to the peer on top of the event layer. The
/// sender fills each packet with the highest-priority pending ghost updates; delivery
/// notification either finalizes lifecycle transitions (ack) or re-dirties the mask
/// bits no later packet covered (drop).
pub struct GhostConnection {
    pub(crate) events: EventConnection,

    sender: Option<GhostSender>,
    local_ghosts: Option<Vec<Option<NetObjectHandle>>>,
    scope_object: Option<NetObjectHandle>,

    ghosting: bool,
    ghosting_sequence: u32,

    ghost_class_count: u32,
    ghost_class_bit_size: u32,

    pub(crate) notices: Vec<GhostNotice>,
    pub(crate) last_error: Option<String>,

    log: Logger,
}

impl GhostConnection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        registry: Rc<ClassRegistry>,
        group: u32,
        is_initiator: bool,
        log: L,
    ) -> GhostConnection {
        let log = logging::child_logger(log);
        let net = NetConnection::new(is_initiator, &log);
        GhostConnection {
            events: EventConnection::new(net, registry, group),
            sender: None,
            local_ghosts: None,
            scope_object: None,
            ghosting: false,
            ghosting_sequence: 0,
            ghost_class_count: 0,
            ghost_class_bit_size: 0,
            notices: Vec::new(),
            last_error: None,
            log,
        }
    }

    // -- forwarding accessors ------------------------------------------------

    #[inline]
    pub fn net(&self) -> &NetConnection {
        &self.events.net
    }

    #[inline]
    pub fn net_mut(&mut self) -> &mut NetConnection {
        &mut self.events.net
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.events.net.state()
    }

    #[inline]
    pub fn post_event(&mut self, event: Rc<dyn NetEvent>) -> bool {
        self.events.post_event(event)
    }

    pub(crate) fn set_last_error(&mut self, error: &str) {
        self.last_error = Some(error.to_owned());
    }

    // -- ghost configuration -------------------------------------------------

    /// Enables ghost transmission from this side of the connection.
    pub fn set_ghost_from(&mut self, ghost_from: bool) {
        if self.sender.is_some() {
            return;
        }
        if ghost_from {
            self.sender = Some(GhostSender::new());
        }
    }

    /// Enables receiving ghosts from the other side of the connection.
    pub fn set_ghost_to(&mut self, ghost_to: bool) {
        if self.local_ghosts.is_some() {
            return;
        }
        if ghost_to {
            self.local_ghosts = Some((0..MAX_GHOST_COUNT).map(|_| None).collect());
        }
    }

    #[inline]
    pub fn does_ghost_from(&self) -> bool {
        self.sender.is_some()
    }

    #[inline]
    pub fn does_ghost_to(&self) -> bool {
        self.local_ghosts.is_some()
    }

    #[inline]
    pub fn is_ghosting(&self) -> bool {
        self.ghosting
    }

    #[inline]
    pub fn ghosting_sequence(&self) -> u32 {
        self.ghosting_sequence
    }

    /// Sets the object whose `perform_scope_query` decides visibility each packet.
    pub fn set_scope_object(&mut self, object: NetObjectHandle) {
        self.scope_object = Some(object);
    }

    /// Begins ghosting objects to the remote host. The remote side answers with a
    /// ready message carrying the same sequence; scoping starts immediately so the
    /// first packets already carry ghosts.
    pub fn activate_ghosting(&mut self) {
        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => return,
        };
        self.ghosting_sequence += 1;
        debug_assert!(
            sender.free_index == 0 && sender.zero_update_index == 0,
            "ghosts present before activation"
        );
        sender.reset_array();
        sender.scoping = true;
        logging::debug!(self.log, "ghosting activated"; "sequence" => self.ghosting_sequence);
        let sequence = self.ghosting_sequence;
        self.post_event(Rc::new(StartGhostingEvent { sequence }));
    }

    /// Stops ghosting to the remote host, which deletes every ghost on the peer.
    pub fn reset_ghosting(&mut self) {
        if self.sender.is_none() {
            return;
        }
        self.ghosting = false;
        self.post_event(Rc::new(EndGhostingEvent));
        self.ghosting_sequence += 1;
        self.clear_ghost_info();
        if let Some(sender) = self.sender.as_mut() {
            sender.scoping = false;
        }
    }

    fn clear_ghost_info(&mut self) {
        self.events.net.clear_notify_ghost_lists();
        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => return,
        };
        for slab in 0..MAX_GHOST_COUNT as u16 {
            if sender.records[slab as usize].array_index < sender.free_index {
                sender.detach(slab);
                sender.records[slab as usize].flight_masks.clear();
                sender.free_record(slab);
            }
        }
        debug_assert!(sender.free_index == 0 && sender.zero_update_index == 0);
    }

    /// Given a ghost id, returns the reconstructed object on the receiving side.
    pub fn resolve_ghost(&self, ghost_index: u32) -> Option<NetObjectHandle> {
        self.local_ghosts
            .as_ref()?
            .get(ghost_index as usize)?
            .clone()
    }

    /// Returns the wire ghost id of a source object, or `None` while the ghost is not
    /// yet addressable on the client.
    pub fn ghost_index(&self, object: &NetObjectHandle) -> Option<u32> {
        let sender = self.sender.as_ref()?;
        let slab = sender.lookup_find(object_key(object))?;
        if sender.records[slab as usize].flags & NOT_AVAILABLE != 0 {
            return None;
        }
        Some(u32::from(slab))
    }

    /// Folds an application dirty mask into this connection's pending state.
    pub(crate) fn mark_dirty(&mut self, key: usize, mask: u32) {
        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => return,
        };
        if let Some(slab) = sender.lookup_find(key) {
            let record = &mut sender.records[slab as usize];
            if record.update_mask == 0 {
                record.update_mask = mask;
                sender.push_non_zero(slab);
            } else {
                record.update_mask |= mask;
            }
        }
    }

    // -- packet pipeline -----------------------------------------------------

    #[inline]
    pub fn is_data_to_transmit(&self) -> bool {
        let pending_ghosts = match &self.sender {
            Some(sender) => sender.zero_update_index != 0,
            None => false,
        };
        self.events.is_data_to_transmit() || pending_ghosts
    }

    /// Checks whether a packet should be sent now, and builds it if so. `force`
    /// bypasses the rate gate and the data check (keepalives), never the window.
    pub fn check_packet_send(&mut self, force: bool, now: u64) -> Option<BitStream> {
        if !self.events.net.ready_to_send(force, now) {
            return None;
        }
        self.prepare_write_packet();
        if self.events.net.window_full() || !(force || self.is_data_to_transmit()) {
            return None;
        }
        let mut note = PacketNotify::new();
        let mut stream = self.events.net.begin_packet(&mut note, now);
        self.write_packet(&mut stream, &mut note);
        Some(self.events.net.end_packet(stream, note))
    }

    /// Processes one incoming connected datagram: ack resolution first (in send
    /// order), then the payload phases, then deferred event dispatch.
    pub fn read_raw_packet(&mut self, data: &[u8], now: u64) -> NetworkResult<()> {
        let stream = self.events.net.begin_read_packet(data, now)?;
        let mut stream = match stream {
            Some(stream) => stream,
            None => return Ok(()),
        };
        while let Some((note, delivered)) = self.events.net.next_notify() {
            self.packet_notify(note, delivered);
        }
        self.read_packet(&mut stream)?;
        self.dispatch_process_queue();
        if self.last_error.is_some() {
            return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
        }
        Ok(())
    }

    /// Runs every event whose ordering constraints are satisfied.
    fn dispatch_process_queue(&mut self) {
        while let Some(mut event) = self.events.process_queue.pop_front() {
            if self.events.net.state() == ConnectionState::Connected {
                event.process(self);
            }
        }
    }

    /// Scope pass run before each packet write: ages every pending ghost, clears
    /// scope marks, and re-marks through the scope object's query.
    fn prepare_write_packet(&mut self) {
        let ghosting = self.ghosting;
        let ghost_class_count = self.ghost_class_count;
        let group = self.events.group();
        let registry = self.events.registry().clone();
        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => return,
        };
        if !ghosting {
            return;
        }
        for position in 0..sender.free_index {
            let slab = sender.ghost_array[position] as usize;
            let record = &mut sender.records[slab];
            if position < sender.zero_update_index {
                record.update_skip_count += 1;
            }
            if record.flags & SCOPE_LOCAL_ALWAYS == 0 {
                record.flags &= !IN_SCOPE;
            }
        }
        if let Some(scope) = self.scope_object.clone() {
            let mut query = ScopeQuery {
                sender,
                registry: &registry,
                group,
                ghost_class_count,
            };
            scope.borrow().perform_scope_query(&mut query);
        }
    }

    fn write_packet(&mut self, stream: &mut BitStream, note: &mut PacketNotify) {
        self.events.write_packet(stream, note);
        self.ghost_write_packet(stream, note);
    }

    fn ghost_write_packet(&mut self, stream: &mut BitStream, note: &mut PacketNotify) {
        let debug_sizes = self.events.net.params().debug_object_sizes;
        if debug_sizes {
            stream.write_int(DEBUG_CHECKSUM, 32);
        }
        let registry = self.events.registry().clone();
        let group = self.events.group();
        let ghost_class_bit_size = self.ghost_class_bit_size;
        let scope_object = self.scope_object.clone();
        let ghosting = self.ghosting && scope_object.is_some();

        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => return,
        };
        if !stream.write_flag(ghosting) {
            return;
        }
        let scope_object = scope_object.expect("ghosting requires a scope object");

        // ghosts that did not survive the scope query are detached for deletion
        let mut to_detach: Vec<u16> = Vec::new();
        for position in 0..sender.free_index {
            let slab = sender.ghost_array[position];
            let flags = sender.records[slab as usize].flags;
            if flags & IN_SCOPE == 0 && flags & (KILL_GHOST | KILLING_GHOST) == 0 {
                to_detach.push(slab);
            }
        }
        for slab in to_detach {
            sender.detach(slab);
        }

        // compute priorities; reap kills that never reached the wire
        let mut max_index: u32 = 0;
        let mut position = sender.zero_update_index;
        while position > 0 {
            position -= 1;
            let slab = sender.ghost_array[position];
            if u32::from(slab) > max_index {
                max_index = u32::from(slab);
            }
            let flags = sender.records[slab as usize].flags;
            if flags & KILL_GHOST != 0 && flags & NOT_YET_GHOSTED != 0 {
                sender.free_record(slab);
                continue;
            }
            if flags & (KILLING_GHOST | GHOSTING) != 0 {
                sender.records[slab as usize].priority = 0.0;
                continue;
            }
            if flags & KILL_GHOST != 0 {
                sender.records[slab as usize].priority = KILL_PRIORITY;
                continue;
            }
            // a vanished source object is treated as out of scope
            let alive = sender.records[slab as usize]
                .obj
                .as_ref()
                .and_then(|weak| weak.upgrade());
            match alive {
                Some(object) => {
                    let record = &sender.records[slab as usize];
                    let priority = object.borrow().update_priority(
                        &scope_object,
                        record.update_mask,
                        record.update_skip_count,
                    );
                    sender.records[slab as usize].priority = priority;
                }
                None => {
                    sender.detach(slab);
                    sender.records[slab as usize].priority = KILL_PRIORITY;
                }
            }
        }

        // ascending priority sort with slab-id tie break keeps the fill deterministic
        let pending = sender.zero_update_index;
        {
            let GhostSender {
                ghost_array,
                records,
                ..
            } = &mut *sender;
            ghost_array[..pending].sort_by(|a, b| {
                let pa = records[*a as usize].priority;
                let pb = records[*b as usize].priority;
                pa.partial_cmp(&pb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.cmp(a))
            });
        }
        for position in 0..pending {
            let slab = sender.ghost_array[position];
            sender.records[slab as usize].array_index = position;
        }

        let mut send_size: u32 = 1;
        let mut walk_index = max_index;
        while walk_index > 1 {
            walk_index >>= 1;
            send_size += 1;
        }
        if send_size < 3 {
            send_size = 3;
        }
        stream.write_int(send_size - 3, 3);

        let mut position = pending;
        while position > 0 && !stream.is_full() {
            position -= 1;
            let slab = sender.ghost_array[position];
            let flags = sender.records[slab as usize].flags;
            if flags & (KILLING_GHOST | GHOSTING) != 0 {
                continue;
            }

            let update_start = stream.bit_position();
            let update_mask = sender.records[slab as usize].update_mask;
            let mut ret_mask = 0u32;

            stream.write_flag(true);
            stream.write_int(u32::from(slab), send_size);
            let killing = flags & KILL_GHOST != 0;
            if !stream.write_flag(killing) {
                if debug_sizes {
                    stream.advance_bit_position(BIT_STREAM_POS_BIT_SIZE as usize);
                }
                let start_position = stream.bit_position();

                let object = match sender.records[slab as usize]
                    .obj
                    .as_ref()
                    .and_then(|weak| weak.upgrade())
                {
                    Some(object) => object,
                    None => {
                        // raced to destruction since the priority pass; skip this entry
                        stream.set_bit_position(update_start);
                        continue;
                    }
                };
                if flags & NOT_YET_GHOSTED != 0 {
                    let class_index = registry
                        .object_index(group, object.borrow().class_name())
                        .expect("scoped object class was validated");
                    stream.write_int(class_index, ghost_class_bit_size);
                }
                ret_mask = object.borrow_mut().pack_update(update_mask, stream);
                debug_assert!(
                    ret_mask & !update_mask == 0,
                    "pack_update cannot set new mask bits"
                );
                if debug_sizes {
                    stream.write_int_at(
                        stream.bit_position() as u32,
                        BIT_STREAM_POS_BIT_SIZE,
                        start_position - BIT_STREAM_POS_BIT_SIZE as usize,
                    );
                }
            }

            if stream.bit_space_available() < MINIMUM_PADDING_BITS || stream.was_error() {
                stream.set_bit_position(update_start);
                stream.clear_error();
                break;
            }

            // the entry fit: record it and advance the ghost's lifecycle
            let record = &mut sender.records[slab as usize];
            let sent_mask;
            let ref_flags;
            if killing {
                record.flags &= !KILL_GHOST;
                record.flags |= KILLING_GHOST;
                record.update_mask = 0;
                sent_mask = update_mask;
                ref_flags = KILLING_GHOST;
                record.flight_masks.push_back(sent_mask);
                sender.push_to_zero(slab);
            } else {
                if record.flags & NOT_YET_GHOSTED != 0 {
                    record.flags &= !NOT_YET_GHOSTED;
                    record.flags |= GHOSTING;
                    ref_flags = GHOSTING;
                } else {
                    ref_flags = 0;
                }
                record.update_mask = ret_mask;
                sent_mask = update_mask & !ret_mask;
                record.update_skip_count = 0;
                record.flight_masks.push_back(sent_mask);
                if ret_mask == 0 {
                    sender.push_to_zero(slab);
                }
            }
            note.ghosts.push(GhostRef {
                index: slab,
                mask: sent_mask,
                flags: ref_flags,
            });
        }
        stream.write_flag(false);
    }

    fn read_packet(&mut self, stream: &mut BitStream) -> NetworkResult<()> {
        self.events.read_packet(stream)?;
        self.ghost_read_packet(stream)
    }

    fn ghost_read_packet(&mut self, stream: &mut BitStream) -> NetworkResult<()> {
        let debug_sizes = self.events.net.params().debug_object_sizes;
        if debug_sizes && stream.read_int(32) != DEBUG_CHECKSUM {
            return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
        }
        let registry = self.events.registry().clone();
        let group = self.events.group();
        let ghost_class_count = self.ghost_class_count;
        let ghost_class_bit_size = self.ghost_class_bit_size;

        let local = match self.local_ghosts.as_mut() {
            Some(local) => local,
            None => return Ok(()),
        };
        if !stream.read_flag() {
            return Ok(());
        }

        let id_bit_size = stream.read_int(3) + 3;
        while stream.read_flag() {
            if stream.was_error() {
                return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
            }
            let index = stream.read_int(id_bit_size) as usize;
            if index >= MAX_GHOST_COUNT {
                return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
            }
            if stream.read_flag() {
                // the ghost is being deleted
                match local[index].take() {
                    Some(object) => {
                        object.borrow_mut().on_ghost_remove();
                    }
                    None => return Err(NetworkError::Fatal(ErrorType::InvalidPacket)),
                }
            } else {
                let ending_position = if debug_sizes {
                    stream.read_int(BIT_STREAM_POS_BIT_SIZE) as usize
                } else {
                    0
                };
                if local[index].is_none() {
                    let class_index = stream.read_int(ghost_class_bit_size);
                    if class_index >= ghost_class_count {
                        return Err(NetworkError::Fatal(ErrorType::InvalidClass));
                    }
                    let object = match registry.create_object(group, class_index) {
                        Some(object) => object,
                        None => return Err(NetworkError::Fatal(ErrorType::InvalidClass)),
                    };
                    local[index] = Some(object.clone());
                    object.borrow_mut().unpack_update(stream, true);
                    if stream.was_error() {
                        return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
                    }
                    if !object.borrow_mut().on_ghost_add() {
                        return Err(NetworkError::Fatal(ErrorType::GhostRefused));
                    }
                } else {
                    let object = local[index].as_ref().expect("checked above").clone();
                    object.borrow_mut().unpack_update(stream, false);
                    if stream.was_error() {
                        return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
                    }
                }
                if debug_sizes && ending_position != stream.bit_position() {
                    return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
                }
            }
        }
        if stream.was_error() {
            return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
        }
        Ok(())
    }

    /// Resolves one in-flight packet's ghost records against its delivery fate.
    pub(crate) fn packet_notify(&mut self, mut note: PacketNotify, delivered: bool) {
        if delivered {
            self.events.packet_received(&mut note);
        } else {
            self.events.packet_dropped(&mut note);
        }
        let sender = match self.sender.as_mut() {
            Some(sender) => sender,
            None => return,
        };
        for ghost_ref in note.ghosts.drain(..) {
            let slab = ghost_ref.index;
            sender.records[slab as usize].flight_masks.pop_front();

            if delivered {
                if ghost_ref.flags & GHOSTING != 0 {
                    sender.records[slab as usize].flags &= !GHOSTING;
                    let object = sender.records[slab as usize]
                        .obj
                        .as_ref()
                        .and_then(|weak| weak.upgrade());
                    if let Some(object) = object {
                        object.borrow_mut().on_ghost_available();
                    }
                } else if ghost_ref.flags & KILLING_GHOST != 0 {
                    sender.free_record(slab);
                }
            } else {
                let remaining = sender.records[slab as usize]
                    .flight_masks
                    .iter()
                    .fold(0u32, |acc, mask| acc | mask);
                let lost = ghost_ref.mask & !remaining;
                if lost != 0 {
                    let record = &mut sender.records[slab as usize];
                    if record.update_mask == 0 {
                        record.update_mask = lost;
                        sender.push_non_zero(slab);
                    } else {
                        record.update_mask |= lost;
                    }
                }
                let record = &mut sender.records[slab as usize];
                if ghost_ref.flags & GHOSTING != 0 {
                    record.flags &= !GHOSTING;
                    record.flags |= NOT_YET_GHOSTED;
                } else if ghost_ref.flags & KILLING_GHOST != 0 {
                    record.flags &= !KILLING_GHOST;
                    record.flags |= KILL_GHOST;
                }
            }
        }
    }

    fn delete_local_ghosts(&mut self) {
        if let Some(local) = self.local_ghosts.as_mut() {
            for slot in local.iter_mut() {
                if let Some(object) = slot.take() {
                    object.borrow_mut().on_ghost_remove();
                }
            }
        }
    }

    // -- ghosting control messages -------------------------------------------

    fn handle_start_ghosting(&mut self, sequence: u32) {
        if !self.does_ghost_to() {
            self.set_last_error("Invalid packet.");
            return;
        }
        logging::debug!(self.log, "ghosting starting"; "sequence" => sequence);
        self.notices.push(GhostNotice::GhostingStarted);
        self.post_event(Rc::new(ReadyForGhostsEvent { sequence }));
    }

    fn handle_ready_for_ghosts(&mut self, sequence: u32) {
        if !self.does_ghost_from() {
            self.set_last_error("Invalid packet.");
            return;
        }
        if sequence != self.ghosting_sequence {
            return;
        }
        logging::debug!(self.log, "remote ready for ghosts"; "sequence" => sequence);
        self.ghosting = true;
    }

    fn handle_end_ghosting(&mut self) {
        if !self.does_ghost_to() {
            self.set_last_error("Invalid packet.");
            return;
        }
        self.delete_local_ghosts();
        self.notices.push(GhostNotice::GhostingStopped);
    }

    // -- handshake payload chaining ------------------------------------------

    pub(crate) fn write_connect_request(&mut self, stream: &mut BitStream) {
        self.events.write_connect_request(stream);
        let count = self
            .events
            .registry()
            .count(self.events.group(), ClassType::Object);
        stream.write_int(count, 32);
    }

    pub(crate) fn read_connect_request(&mut self, stream: &mut BitStream) -> Result<(), String> {
        self.events.read_connect_request(stream)?;
        let remote_count = stream.read_int(32);
        let registry = self.events.registry().clone();
        let group = self.events.group();
        let my_count = registry.count(group, ClassType::Object);
        if my_count <= remote_count {
            self.ghost_class_count = my_count;
        } else {
            self.ghost_class_count = remote_count;
            if !registry.is_version_border(group, ClassType::Object, remote_count) {
                return Err("Version mismatch".to_owned());
            }
        }
        self.ghost_class_bit_size = ClassRegistry::bit_size(self.ghost_class_count);
        Ok(())
    }

    pub(crate) fn write_connect_accept(&mut self, stream: &mut BitStream) {
        self.events.write_connect_accept(stream);
        stream.write_int(self.ghost_class_count, 32);
    }

    pub(crate) fn read_connect_accept(&mut self, stream: &mut BitStream) -> Result<(), String> {
        self.events.read_connect_accept(stream)?;
        let count = stream.read_int(32);
        let registry = self.events.registry().clone();
        let group = self.events.group();
        if count > registry.count(group, ClassType::Object) {
            return Err("Version mismatch".to_owned());
        }
        if !registry.is_version_border(group, ClassType::Object, count) {
            return Err("Version mismatch".to_owned());
        }
        self.ghost_class_count = count;
        self.ghost_class_bit_size = ClassRegistry::bit_size(count);
        Ok(())
    }
}

// -- ghosting control events ------------------------------------------------

const START_GHOSTING_NAME: &str = "GhostConnection::StartGhosting";
const READY_FOR_GHOSTS_NAME: &str = "GhostConnection::ReadyForGhosts";
const END_GHOSTING_NAME: &str = "GhostConnection::EndGhosting";

struct StartGhostingEvent {
    sequence: u32,
}

impl NetEvent for StartGhostingEvent {
    fn class_name(&self) -> &'static str {
        START_GHOSTING_NAME
    }
    fn guarantee_type(&self) -> GuaranteeType {
        GuaranteeType::GuaranteedOrdered
    }
    fn direction(&self) -> EventDirection {
        EventDirection::Any
    }
    fn pack(&self, stream: &mut BitStream, _strings: &mut StringTableWrite) {
        stream.write_int(self.sequence, 32);
    }
    fn unpack(&mut self, stream: &mut BitStream, _strings: &mut StringTableRead) {
        self.sequence = stream.read_int(32);
    }
    fn process(&mut self, conn: &mut GhostConnection) {
        conn.handle_start_ghosting(self.sequence);
    }
}

struct ReadyForGhostsEvent {
    sequence: u32,
}

impl NetEvent for ReadyForGhostsEvent {
    fn class_name(&self) -> &'static str {
        READY_FOR_GHOSTS_NAME
    }
    fn guarantee_type(&self) -> GuaranteeType {
        GuaranteeType::GuaranteedOrdered
    }
    fn direction(&self) -> EventDirection {
        EventDirection::Any
    }
    fn pack(&self, stream: &mut BitStream, _strings: &mut StringTableWrite) {
        stream.write_int(self.sequence, 32);
    }
    fn unpack(&mut self, stream: &mut BitStream, _strings: &mut StringTableRead) {
        self.sequence = stream.read_int(32);
    }
    fn process(&mut self, conn: &mut GhostConnection) {
        conn.handle_ready_for_ghosts(self.sequence);
    }
}

struct EndGhostingEvent;

impl NetEvent for EndGhostingEvent {
    fn class_name(&self) -> &'static str {
        END_GHOSTING_NAME
    }
    fn guarantee_type(&self) -> GuaranteeType {
        GuaranteeType::GuaranteedOrdered
    }
    fn direction(&self) -> EventDirection {
        EventDirection::Any
    }
    fn pack(&self, _stream: &mut BitStream, _strings: &mut StringTableWrite) {}
    fn unpack(&mut self, _stream: &mut BitStream, _strings: &mut StringTableRead) {}
    fn process(&mut self, conn: &mut GhostConnection) {
        conn.handle_end_ghosting();
    }
}

fn start_ghosting_ctor() -> Box<dyn NetEvent> {
    Box::new(StartGhostingEvent { sequence: 0 })
}

fn ready_for_ghosts_ctor() -> Box<dyn NetEvent> {
    Box::new(ReadyForGhostsEvent { sequence: 0 })
}

fn end_ghosting_ctor() -> Box<dyn NetEvent> {
    Box::new(EndGhostingEvent)
}

/// Seeds the ghosting control events into every class group so both sides of any
/// connection agree on their indices.
pub(crate) fn register_control_events(builder: &mut ClassRegistryBuilder) {
    builder.register_event(START_GHOSTING_NAME, !0, 0, start_ghosting_ctor);
    builder.register_event(READY_FOR_GHOSTS_NAME, !0, 0, ready_for_ghosts_ctor);
    builder.register_event(END_GHOSTING_NAME, !0, 0, end_ghosting_ctor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{object_key, NetObject};
    use crate::registry::CLASS_GROUP_GAME;
    use crate::registry::CLASS_GROUP_GAME_MASK;
    use std::cell::RefCell;

    thread_local! {
        static PROCESSED: RefCell<Vec<String>> = RefCell::new(Vec::new());
        static DELIVERED: RefCell<Vec<(String, bool)>> = RefCell::new(Vec::new());
        static GHOST_ADDS: RefCell<u32> = RefCell::new(0);
        static GHOST_REMOVES: RefCell<u32> = RefCell::new(0);
        static UNPACKED_STATE: RefCell<(i32, i32, String)> =
            RefCell::new((0, 0, String::new()));
        static PRIORITY_SCOPE_SEEN: RefCell<usize> = RefCell::new(0);
    }

    fn reset_logs() {
        PROCESSED.with(|log| log.borrow_mut().clear());
        DELIVERED.with(|log| log.borrow_mut().clear());
        GHOST_ADDS.with(|count| *count.borrow_mut() = 0);
        GHOST_REMOVES.with(|count| *count.borrow_mut() = 0);
        UNPACKED_STATE.with(|state| *state.borrow_mut() = (0, 0, String::new()));
        PRIORITY_SCOPE_SEEN.with(|seen| *seen.borrow_mut() = 0);
    }

    fn processed() -> Vec<String> {
        PROCESSED.with(|log| log.borrow().clone())
    }

    fn delivered() -> Vec<(String, bool)> {
        DELIVERED.with(|log| log.borrow().clone())
    }

    struct ChatEvent {
        message: String,
        guarantee: GuaranteeType,
        direction: EventDirection,
    }

    impl ChatEvent {
        fn ordered(message: &str) -> Rc<dyn NetEvent> {
            Rc::new(ChatEvent {
                message: message.to_owned(),
                guarantee: GuaranteeType::GuaranteedOrdered,
                direction: EventDirection::Any,
            })
        }

        fn unguaranteed(message: &str) -> Rc<dyn NetEvent> {
            Rc::new(ChatEvent {
                message: message.to_owned(),
                guarantee: GuaranteeType::Unguaranteed,
                direction: EventDirection::Any,
            })
        }
    }

    impl NetEvent for ChatEvent {
        fn class_name(&self) -> &'static str {
            "ChatEvent"
        }
        fn guarantee_type(&self) -> GuaranteeType {
            self.guarantee
        }
        fn direction(&self) -> EventDirection {
            self.direction
        }
        fn pack(&self, stream: &mut BitStream, _strings: &mut StringTableWrite) {
            stream.write_string(&self.message);
        }
        fn unpack(&mut self, stream: &mut BitStream, _strings: &mut StringTableRead) {
            self.message = stream.read_string();
        }
        fn process(&mut self, _conn: &mut GhostConnection) {
            PROCESSED.with(|log| log.borrow_mut().push(self.message.clone()));
        }
        fn notify_delivered(&self, made_it: bool) {
            DELIVERED.with(|log| log.borrow_mut().push((self.message.clone(), made_it)));
        }
    }

    fn chat_ctor() -> Box<dyn NetEvent> {
        Box::new(ChatEvent {
            message: String::new(),
            guarantee: GuaranteeType::GuaranteedOrdered,
            direction: EventDirection::Any,
        })
    }

    struct ServerOnlyEvent;

    impl NetEvent for ServerOnlyEvent {
        fn class_name(&self) -> &'static str {
            "ServerOnlyEvent"
        }
        fn direction(&self) -> EventDirection {
            EventDirection::InitiatorToHost
        }
        fn pack(&self, _stream: &mut BitStream, _strings: &mut StringTableWrite) {}
        fn unpack(&mut self, _stream: &mut BitStream, _strings: &mut StringTableRead) {}
        fn process(&mut self, _conn: &mut GhostConnection) {}
    }

    fn server_only_ctor() -> Box<dyn NetEvent> {
        Box::new(ServerOnlyEvent)
    }

    struct InternEvent {
        name: String,
    }

    impl NetEvent for InternEvent {
        fn class_name(&self) -> &'static str {
            "InternEvent"
        }
        fn pack(&self, stream: &mut BitStream, strings: &mut StringTableWrite) {
            strings.write(stream, &self.name);
        }
        fn unpack(&mut self, stream: &mut BitStream, strings: &mut StringTableRead) {
            self.name = strings.read(stream);
        }
        fn process(&mut self, _conn: &mut GhostConnection) {
            PROCESSED.with(|log| log.borrow_mut().push(self.name.clone()));
        }
    }

    fn intern_ctor() -> Box<dyn NetEvent> {
        Box::new(InternEvent {
            name: String::new(),
        })
    }

    const POSITION_MASK: u32 = 1 << 0;
    const LABEL_MASK: u32 = 1 << 1;

    struct TestObject {
        x: i32,
        y: i32,
        label: String,
    }

    impl TestObject {
        fn create(x: i32, y: i32) -> Rc<RefCell<TestObject>> {
            Rc::new(RefCell::new(TestObject {
                x,
                y,
                label: String::new(),
            }))
        }
    }

    impl NetObject for TestObject {
        fn class_name(&self) -> &'static str {
            "TestObject"
        }
        fn pack_update(&mut self, mask: u32, stream: &mut BitStream) -> u32 {
            if stream.write_flag(mask & POSITION_MASK != 0) {
                stream.write_signed_int(self.x, 16);
                stream.write_signed_int(self.y, 16);
            }
            if stream.write_flag(mask & LABEL_MASK != 0) {
                stream.write_string(&self.label);
            }
            0
        }
        fn unpack_update(&mut self, stream: &mut BitStream, _initial_update: bool) {
            if stream.read_flag() {
                self.x = stream.read_signed_int(16);
                self.y = stream.read_signed_int(16);
            }
            if stream.read_flag() {
                self.label = stream.read_string();
            }
            let snapshot = (self.x, self.y, self.label.clone());
            UNPACKED_STATE.with(|state| *state.borrow_mut() = snapshot);
        }
        fn on_ghost_add(&mut self) -> bool {
            GHOST_ADDS.with(|count| *count.borrow_mut() += 1);
            true
        }
        fn on_ghost_remove(&mut self) {
            GHOST_REMOVES.with(|count| *count.borrow_mut() += 1);
        }
    }

    fn test_object_ctor() -> NetObjectHandle {
        TestObject::create(0, 0)
    }

    /// Object whose priority hook ranks against the connection's scope object, the
    /// way a game object ranks by distance from the camera.
    struct RangedObject;

    impl NetObject for RangedObject {
        fn class_name(&self) -> &'static str {
            "RangedObject"
        }
        fn pack_update(&mut self, _mask: u32, stream: &mut BitStream) -> u32 {
            stream.write_flag(false);
            0
        }
        fn unpack_update(&mut self, stream: &mut BitStream, _initial_update: bool) {
            stream.read_flag();
        }
        fn on_ghost_add(&mut self) -> bool {
            GHOST_ADDS.with(|count| *count.borrow_mut() += 1);
            true
        }
        fn update_priority(
            &self,
            scope_object: &NetObjectHandle,
            _mask: u32,
            update_skips: u32,
        ) -> f32 {
            PRIORITY_SCOPE_SEEN.with(|seen| *seen.borrow_mut() = object_key(scope_object));
            update_skips as f32 * 0.1
        }
    }

    fn ranged_object_ctor() -> NetObjectHandle {
        Rc::new(RefCell::new(RangedObject))
    }

    /// Scope object marking everything on its visibility list.
    struct TestScope {
        visible: RefCell<Vec<NetObjectHandle>>,
    }

    impl NetObject for TestScope {
        fn class_name(&self) -> &'static str {
            "TestScope"
        }
        fn pack_update(&mut self, _mask: u32, _stream: &mut BitStream) -> u32 {
            0
        }
        fn unpack_update(&mut self, _stream: &mut BitStream, _initial_update: bool) {}
        fn perform_scope_query(&self, query: &mut ScopeQuery) {
            for object in self.visible.borrow().iter() {
                query.object_in_scope(object);
            }
        }
    }

    fn build_registry() -> Rc<ClassRegistry> {
        let mut builder = ClassRegistryBuilder::new();
        builder
            .register_event("ChatEvent", CLASS_GROUP_GAME_MASK, 0, chat_ctor)
            .register_event("ServerOnlyEvent", CLASS_GROUP_GAME_MASK, 0, server_only_ctor)
            .register_event("InternEvent", CLASS_GROUP_GAME_MASK, 0, intern_ctor)
            .register_object("TestObject", CLASS_GROUP_GAME_MASK, 0, test_object_ctor)
            .register_object("RangedObject", CLASS_GROUP_GAME_MASK, 0, ranged_object_ctor);
        builder.freeze()
    }

    /// Wires an initiator/host pair through the class negotiation and sequence
    /// exchange a real handshake would perform.
    fn connect_pair() -> (GhostConnection, GhostConnection) {
        reset_logs();
        let registry = build_registry();
        let mut a = GhostConnection::new(registry.clone(), CLASS_GROUP_GAME, true, None);
        let mut b = GhostConnection::new(registry, CLASS_GROUP_GAME, false, None);

        let mut request = BitStream::with_size(64);
        a.write_connect_request(&mut request);
        let mut reader = BitStream::from_bytes(request.bytes());
        b.read_connect_request(&mut reader).unwrap();

        let mut accept = BitStream::with_size(64);
        b.write_connect_accept(&mut accept);
        let mut reader = BitStream::from_bytes(accept.bytes());
        a.read_connect_accept(&mut reader).unwrap();

        a.net_mut()
            .set_initial_recv_sequence(b.net().initial_send_sequence());
        b.net_mut()
            .set_initial_recv_sequence(a.net().initial_send_sequence());
        a.net_mut().set_established(0);
        b.net_mut().set_established(0);
        (a, b)
    }

    /// Sends one forced packet, optionally delivering it.
    fn pump(from: &mut GhostConnection, to: &mut GhostConnection, now: u64, deliver: bool) {
        let stream = from
            .check_packet_send(true, now)
            .expect("forced send always produces a packet");
        if deliver {
            to.read_raw_packet(stream.bytes(), now).unwrap();
        }
    }

    fn validate_partition(conn: &GhostConnection) {
        let sender = conn.sender.as_ref().expect("sender enabled");
        for position in 0..MAX_GHOST_COUNT {
            let slab = sender.ghost_array[position] as usize;
            assert_eq!(sender.records[slab].array_index, position);
            if position < sender.zero_update_index {
                assert!(sender.records[slab].update_mask != 0);
            } else if position < sender.free_index {
                assert_eq!(sender.records[slab].update_mask, 0);
            }
        }
        assert!(sender.zero_update_index <= sender.free_index);
        assert!(sender.free_index <= MAX_GHOST_COUNT);
    }

    /// Runs the ghosting activation exchange until the sender is live.
    fn activate(server: &mut GhostConnection, client: &mut GhostConnection, now: &mut u64) {
        server.activate_ghosting();
        *now += 10;
        pump(server, client, *now, true); // start ghosting
        *now += 10;
        pump(client, server, *now, true); // ready for ghosts
        assert!(server.is_ghosting());
    }

    #[test]
    fn test_ordered_events_process_and_notify_in_order() {
        let (mut a, mut b) = connect_pair();

        for i in 0..3 {
            assert!(a.post_event(ChatEvent::ordered(&format!("m{}", i))));
        }
        pump(&mut a, &mut b, 10, true);
        assert_eq!(processed(), vec!["m0", "m1", "m2"]);

        pump(&mut b, &mut a, 20, true);
        assert_eq!(
            delivered(),
            vec![
                ("m0".to_owned(), true),
                ("m1".to_owned(), true),
                ("m2".to_owned(), true)
            ]
        );
    }

    #[test]
    fn test_ordered_event_reinsertion_after_drop() {
        let (mut a, mut b) = connect_pair();

        // E0..E3 arrive, E4/E5 are lost in flight, E6..E9 arrive
        for i in 0..4 {
            a.post_event(ChatEvent::ordered(&format!("e{}", i)));
        }
        pump(&mut a, &mut b, 10, true);
        for i in 4..6 {
            a.post_event(ChatEvent::ordered(&format!("e{}", i)));
        }
        pump(&mut a, &mut b, 20, false);
        for i in 6..10 {
            a.post_event(ChatEvent::ordered(&format!("e{}", i)));
        }
        pump(&mut a, &mut b, 30, true);

        // the receiver holds e6..e9 until the gap fills
        assert_eq!(processed(), vec!["e0", "e1", "e2", "e3"]);

        // the ack packet reports the loss; e4/e5 requeue and go out again
        pump(&mut b, &mut a, 40, true);
        pump(&mut a, &mut b, 50, true);
        assert_eq!(
            processed(),
            vec!["e0", "e1", "e2", "e3", "e4", "e5", "e6", "e7", "e8", "e9"]
        );

        // sender-side delivery notifications fire in post order, all successful
        pump(&mut b, &mut a, 60, true);
        let delivered = delivered();
        assert_eq!(delivered.len(), 10);
        for (i, (message, made_it)) in delivered.iter().enumerate() {
            assert_eq!(message, &format!("e{}", i));
            assert!(made_it);
        }
    }

    #[test]
    fn test_unguaranteed_event_dropped_notifies_false() {
        let (mut a, mut b) = connect_pair();

        a.post_event(ChatEvent::unguaranteed("transient"));
        pump(&mut a, &mut b, 10, false);
        pump(&mut a, &mut b, 20, true); // the next packet's ack info resolves the loss
        pump(&mut b, &mut a, 30, true);

        assert_eq!(processed(), Vec::<String>::new());
        assert_eq!(delivered(), vec![("transient".to_owned(), false)]);
    }

    #[test]
    fn test_wrong_direction_event_kills_connection() {
        let (mut a, mut b) = connect_pair();

        // an initiator-to-host event arriving at the initiator is a protocol error
        assert!(b.post_event(Rc::new(ServerOnlyEvent)));
        let stream = b.check_packet_send(true, 10).unwrap();
        let result = a.read_raw_packet(stream.bytes(), 10);
        assert_eq!(
            result.unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidPacket)
        );
    }

    #[test]
    fn test_string_table_entry_roundtrip_over_connection() {
        let (mut a, mut b) = connect_pair();

        a.post_event(Rc::new(InternEvent {
            name: "mission/deathmatch".to_owned(),
        }));
        pump(&mut a, &mut b, 10, true);
        pump(&mut b, &mut a, 20, true);

        // second use of the interned string travels as a bare table index
        a.post_event(Rc::new(InternEvent {
            name: "mission/deathmatch".to_owned(),
        }));
        pump(&mut a, &mut b, 30, true);

        assert_eq!(
            processed(),
            vec!["mission/deathmatch", "mission/deathmatch"]
        );
    }

    #[test]
    fn test_ghost_scope_oscillation() {
        let (mut client, mut server) = connect_pair();
        server.set_ghost_from(true);
        client.set_ghost_to(true);

        let scope = Rc::new(RefCell::new(TestScope {
            visible: RefCell::new(Vec::new()),
        }));
        server.set_scope_object(scope.clone());

        let mut now = 0u64;
        activate(&mut server, &mut client, &mut now);

        // object enters scope and is ghosted
        let object = TestObject::create(5, -7);
        let handle: NetObjectHandle = object.clone();
        scope.borrow().visible.borrow_mut().push(handle.clone());
        now += 10;
        pump(&mut server, &mut client, now, true);
        validate_partition(&server);
        assert_eq!(GHOST_ADDS.with(|count| *count.borrow()), 1);

        let ghost_index = {
            now += 10;
            pump(&mut client, &mut server, now, true); // ack: Ghosting -> Ghosted
            server.ghost_index(&handle).expect("ghost now addressable")
        };
        assert!(client.resolve_ghost(ghost_index).is_some());

        // leaving scope writes a delete entry; the ack frees the server slot
        scope.borrow().visible.borrow_mut().clear();
        now += 10;
        pump(&mut server, &mut client, now, true);
        validate_partition(&server);
        assert_eq!(GHOST_REMOVES.with(|count| *count.borrow()), 1);
        assert!(client.resolve_ghost(ghost_index).is_none());
        now += 10;
        pump(&mut client, &mut server, now, true);
        validate_partition(&server);
        assert_eq!(server.ghost_index(&handle), None);

        // re-entering scope ghosts the object again
        scope.borrow().visible.borrow_mut().push(handle.clone());
        now += 10;
        pump(&mut server, &mut client, now, true);
        validate_partition(&server);
        assert_eq!(GHOST_ADDS.with(|count| *count.borrow()), 2);
    }

    #[test]
    fn test_ghost_mask_recovery_on_dropped_packet() {
        let (mut client, mut server) = connect_pair();
        server.set_ghost_from(true);
        client.set_ghost_to(true);

        let scope = Rc::new(RefCell::new(TestScope {
            visible: RefCell::new(Vec::new()),
        }));
        server.set_scope_object(scope.clone());

        let mut now = 0u64;
        activate(&mut server, &mut client, &mut now);

        let object = TestObject::create(1, 1);
        let handle: NetObjectHandle = object.clone();
        scope.borrow().visible.borrow_mut().push(handle.clone());
        now += 10;
        pump(&mut server, &mut client, now, true);
        now += 10;
        pump(&mut client, &mut server, now, true);

        // a position change is written into a packet that gets lost
        object.borrow_mut().x = 42;
        object.borrow_mut().y = -42;
        server.mark_dirty(object_key(&handle), POSITION_MASK);
        now += 10;
        pump(&mut server, &mut client, now, false);

        // a label change goes out (and arrives) while the position is in flight
        object.borrow_mut().label = "renamed".to_owned();
        server.mark_dirty(object_key(&handle), LABEL_MASK);
        now += 10;
        pump(&mut server, &mut client, now, true);
        validate_partition(&server);

        // the ack stream reports the first packet lost; the position bits are
        // re-dirtied and retransmitted
        now += 10;
        pump(&mut client, &mut server, now, true);
        validate_partition(&server);
        now += 10;
        pump(&mut server, &mut client, now, true);

        let ghost_index = server.ghost_index(&handle).expect("addressable");
        assert!(client.resolve_ghost(ghost_index).is_some());
        let (x, y, label) = UNPACKED_STATE.with(|state| state.borrow().clone());
        assert_eq!((x, y), (42, -42));
        assert_eq!(label, "renamed");
    }

    #[test]
    fn test_update_priority_ranks_against_the_scope_object() {
        let (mut client, mut server) = connect_pair();
        server.set_ghost_from(true);
        client.set_ghost_to(true);

        let scope = Rc::new(RefCell::new(TestScope {
            visible: RefCell::new(Vec::new()),
        }));
        let scope_handle: NetObjectHandle = scope.clone();
        server.set_scope_object(scope_handle.clone());

        let mut now = 0u64;
        activate(&mut server, &mut client, &mut now);

        let object: NetObjectHandle = Rc::new(RefCell::new(RangedObject));
        scope.borrow().visible.borrow_mut().push(object);
        now += 10;
        pump(&mut server, &mut client, now, true);

        // the priority pass handed the hook this connection's scope object
        assert_eq!(
            PRIORITY_SCOPE_SEEN.with(|seen| *seen.borrow()),
            object_key(&scope_handle)
        );
        assert_eq!(GHOST_ADDS.with(|count| *count.borrow()), 1);
    }

    #[test]
    fn test_end_ghosting_deletes_local_ghosts() {
        let (mut client, mut server) = connect_pair();
        server.set_ghost_from(true);
        client.set_ghost_to(true);

        let scope = Rc::new(RefCell::new(TestScope {
            visible: RefCell::new(Vec::new()),
        }));
        server.set_scope_object(scope.clone());

        let mut now = 0u64;
        activate(&mut server, &mut client, &mut now);

        let object = TestObject::create(3, 4);
        let handle: NetObjectHandle = object.clone();
        scope.borrow().visible.borrow_mut().push(handle);
        now += 10;
        pump(&mut server, &mut client, now, true);
        assert_eq!(GHOST_ADDS.with(|count| *count.borrow()), 1);

        server.reset_ghosting();
        now += 10;
        pump(&mut server, &mut client, now, true);
        assert_eq!(GHOST_REMOVES.with(|count| *count.borrow()), 1);
        assert_eq!(client.notices, vec![GhostNotice::GhostingStarted, GhostNotice::GhostingStopped]);
    }
}
