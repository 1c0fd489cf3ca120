use crate::bitstream::BitStream;
use crate::connection::{ConnectionState, NetConnection, PacketNotify};
use crate::ghost::GhostConnection;
use crate::registry::{ClassRegistry, ClassType};
use crate::stringtable::{ConnectionStringTable, StringTableRead, StringTableWrite};
use crate::support::constants::MINIMUM_PADDING_BITS;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use quark::logging;
use std::collections::VecDeque;
use std::rc::Rc;

/// Delivery guarantee classes for events.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GuaranteeType {
    /// Delivery is guaranteed and `process` runs in post order relative to other
    /// ordered events.
    GuaranteedOrdered,
    /// Delivery is guaranteed; `process` runs in arrival order.
    Guaranteed,
    /// Sent once and dropped on packet loss.
    Unguaranteed,
}

/// Direction an event is allowed to travel. Receiving an event from the forbidden
/// side is a protocol error that kills the connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventDirection {
    Any,
    HostToInitiator,
    InitiatorToHost,
}

/// An event transmitted over an `EventConnection`. Sender-side instances are shared
/// (`Rc`) and held by the connection until their delivery fate is known; receiver-side
/// instances are constructed from the class registry and boxed.
pub trait NetEvent {
    fn class_name(&self) -> &'static str;

    fn guarantee_type(&self) -> GuaranteeType {
        GuaranteeType::GuaranteedOrdered
    }

    fn direction(&self) -> EventDirection {
        EventDirection::Any
    }

    /// Writes the event payload on the origin side.
    fn pack(&self, stream: &mut BitStream, strings: &mut StringTableWrite);

    /// Reads the event payload on the destination side.
    fn unpack(&mut self, stream: &mut BitStream, strings: &mut StringTableRead);

    /// Invoked once the event is ready for application processing: immediately after
    /// unpack for unordered events, after all predecessors for ordered ones.
    fn process(&mut self, conn: &mut GhostConnection);

    /// Called when the event is queued on a connection, before any transmission.
    fn notify_posted(&self) {}

    /// Called each time the event is written into an outgoing packet.
    fn notify_sent(&self) {}

    /// Called exactly once per posted event when its fate is known; `made_it` is
    /// false only for unguaranteed events lost in transit.
    fn notify_delivered(&self, _made_it: bool) {}
}

/// Associates a posted event with its ordered sequence number while it sits on a send
/// queue or an in-flight packet notify.
pub struct EventNote {
    pub event: Rc<dyn NetEvent>,
    pub seq_count: i32,
}

struct RecvNote {
    event: Box<dyn NetEvent>,
    seq_count: i32,
}

pub(crate) const INVALID_SEND_EVENT_SEQ: i32 = -1;
const FIRST_VALID_SEND_EVENT_SEQ: i32 = 0;
/// Ordered events stall once they run this far ahead of the last acknowledged one.
const ORDERED_EVENT_WINDOW: i32 = 126;
pub(crate) const DEBUG_CHECKSUM: u32 = 0xF00D_BAAD;
pub(crate) const BIT_STREAM_POS_BIT_SIZE: u32 = 16;

/// Layers ordered/unordered guaranteed and unguaranteed event delivery on top of the
/// notify protocol. Each packet carries two phases: unordered events first, then
/// ordered events tagged with a 7-bit wrapped sequence.
pub struct EventConnection {
    pub(crate) net: NetConnection,
    registry: Rc<ClassRegistry>,
    group: u32,

    string_table: ConnectionStringTable,

    send_queue: VecDeque<EventNote>,
    unordered_send_queue: VecDeque<EventNote>,
    notify_list: Vec<EventNote>,
    wait_seq_events: Vec<RecvNote>,
    pub(crate) process_queue: VecDeque<Box<dyn NetEvent>>,

    next_send_event_seq: i32,
    next_recv_event_seq: i32,
    last_acked_event_seq: i32,

    event_class_count: u32,
    event_class_bit_size: u32,
    event_class_version: u32,
}

impl EventConnection {
    pub fn new(net: NetConnection, registry: Rc<ClassRegistry>, group: u32) -> EventConnection {
        EventConnection {
            net,
            registry,
            group,
            string_table: ConnectionStringTable::new(),
            send_queue: VecDeque::new(),
            unordered_send_queue: VecDeque::new(),
            notify_list: Vec::new(),
            wait_seq_events: Vec::new(),
            process_queue: VecDeque::new(),
            next_send_event_seq: FIRST_VALID_SEND_EVENT_SEQ,
            next_recv_event_seq: FIRST_VALID_SEND_EVENT_SEQ,
            last_acked_event_seq: INVALID_SEND_EVENT_SEQ,
            event_class_count: 0,
            event_class_bit_size: 0,
            event_class_version: 0,
        }
    }

    #[inline]
    pub fn registry(&self) -> &Rc<ClassRegistry> {
        &self.registry
    }

    #[inline]
    pub fn group(&self) -> u32 {
        self.group
    }

    /// The highest class version shared with the peer after negotiation.
    #[inline]
    pub fn event_class_version(&self) -> u32 {
        self.event_class_version
    }

    /// Posts an event for transmission to the remote host. Returns false when the
    /// event's class is unknown or outside the negotiated class count.
    pub fn post_event(&mut self, event: Rc<dyn NetEvent>) -> bool {
        let class_index = match self.registry.event_index(self.group, event.class_name()) {
            Some(index) => index,
            None => return false,
        };
        if self.net.state() == ConnectionState::Connected && class_index >= self.event_class_count
        {
            return false;
        }

        event.notify_posted();
        let guarantee = event.guarantee_type();
        let mut note = EventNote {
            event,
            seq_count: INVALID_SEND_EVENT_SEQ,
        };
        if guarantee == GuaranteeType::GuaranteedOrdered {
            note.seq_count = self.next_send_event_seq;
            self.next_send_event_seq += 1;
            self.send_queue.push_back(note);
        } else {
            self.unordered_send_queue.push_back(note);
        }
        true
    }

    /// True when events are waiting to go out.
    pub fn is_data_to_transmit(&self) -> bool {
        !self.unordered_send_queue.is_empty() || !self.send_queue.is_empty()
    }

    /// Writes pending events into the packet and attaches them to its notify record.
    pub(crate) fn write_packet(&mut self, stream: &mut BitStream, note: &mut PacketNotify) {
        let debug_sizes = self.net.params().debug_object_sizes;
        if debug_sizes {
            stream.write_int(DEBUG_CHECKSUM, 32);
        }

        let mut packed: Vec<EventNote> = Vec::new();

        // first phase: events with no ordering constraint
        while let Some(front) = self.unordered_send_queue.front() {
            if stream.is_full() {
                break;
            }
            let entry_start = stream.bit_position();
            stream.write_flag(true);
            if debug_sizes {
                stream.advance_bit_position(BIT_STREAM_POS_BIT_SIZE as usize);
            }
            let class_index = self
                .registry
                .event_index(self.group, front.event.class_name())
                .expect("posted event class was validated");
            stream.write_int(class_index, self.event_class_bit_size);
            {
                let mut strings = StringTableWrite {
                    table: &mut self.string_table,
                    packet_strings: &mut note.strings,
                };
                front.event.pack(stream, &mut strings);
            }
            if debug_sizes {
                stream.write_int_at(
                    stream.bit_position() as u32,
                    BIT_STREAM_POS_BIT_SIZE,
                    entry_start + 1,
                );
            }
            if stream.bit_space_available() < MINIMUM_PADDING_BITS || stream.was_error() {
                stream.set_bit_position(entry_start);
                stream.clear_error();
                break;
            }
            let sent = self.unordered_send_queue.pop_front().expect("front checked");
            packed.push(sent);
        }
        stream.write_flag(false);

        // second phase: ordered events, sequence-tagged and delta encoded
        let mut prev_seq = -2i32;
        while let Some(front) = self.send_queue.front() {
            if stream.is_full() {
                break;
            }
            if front.seq_count > self.last_acked_event_seq + ORDERED_EVENT_WINDOW {
                break;
            }
            let entry_start = stream.bit_position();
            stream.write_flag(true);
            if !stream.write_flag(front.seq_count == prev_seq + 1) {
                stream.write_int(front.seq_count as u32 & 0x7F, 7);
            }
            prev_seq = front.seq_count;
            if debug_sizes {
                stream.advance_bit_position(BIT_STREAM_POS_BIT_SIZE as usize);
            }
            let size_mark = stream.bit_position();
            let class_index = self
                .registry
                .event_index(self.group, front.event.class_name())
                .expect("posted event class was validated");
            stream.write_int(class_index, self.event_class_bit_size);
            {
                let mut strings = StringTableWrite {
                    table: &mut self.string_table,
                    packet_strings: &mut note.strings,
                };
                front.event.pack(stream, &mut strings);
            }
            if debug_sizes {
                stream.write_int_at(
                    stream.bit_position() as u32,
                    BIT_STREAM_POS_BIT_SIZE,
                    size_mark - BIT_STREAM_POS_BIT_SIZE as usize,
                );
            }
            if stream.bit_space_available() < MINIMUM_PADDING_BITS || stream.was_error() {
                stream.set_bit_position(entry_start);
                stream.clear_error();
                break;
            }
            let sent = self.send_queue.pop_front().expect("front checked");
            packed.push(sent);
        }
        stream.write_flag(false);

        for sent in &packed {
            sent.event.notify_sent();
        }
        note.events = packed;
    }

    /// Reads both event phases from the packet, dispatching unordered events at once
    /// and buffering ordered events until their predecessors have arrived.
    pub(crate) fn read_packet(&mut self, stream: &mut BitStream) -> NetworkResult<()> {
        let debug_sizes = self.net.params().debug_object_sizes;
        if debug_sizes && stream.read_int(32) != DEBUG_CHECKSUM {
            return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
        }

        let mut prev_seq = -2i32;
        let mut unguaranteed_phase = true;

        loop {
            let mut bit = stream.read_flag();
            if unguaranteed_phase && !bit {
                unguaranteed_phase = false;
                bit = stream.read_flag();
            }
            if !bit {
                break;
            }
            if stream.was_error() {
                return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
            }

            let mut seq = INVALID_SEND_EVENT_SEQ;
            if !unguaranteed_phase {
                if stream.read_flag() {
                    seq = (prev_seq + 1) & 0x7F;
                } else {
                    seq = stream.read_int(7) as i32;
                }
                prev_seq = seq;
            }

            let ending_position = if debug_sizes {
                stream.read_int(BIT_STREAM_POS_BIT_SIZE) as usize
            } else {
                0
            };

            let class_index = stream.read_int(self.event_class_bit_size);
            if class_index >= self.event_class_count {
                return Err(NetworkError::Fatal(ErrorType::InvalidClass));
            }
            let mut event = match self.registry.create_event(self.group, class_index) {
                Some(event) => event,
                None => return Err(NetworkError::Fatal(ErrorType::InvalidClass)),
            };

            // enforce the direction the event is allowed to travel
            let bad_direction = match event.direction() {
                EventDirection::Any => false,
                EventDirection::HostToInitiator => !self.net.is_initiator(),
                EventDirection::InitiatorToHost => self.net.is_initiator(),
            };
            if bad_direction {
                logging::debug!(self.net.log(), "event arrived from forbidden direction";
                                "class" => event.class_name());
                return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
            }

            {
                let mut strings = StringTableRead {
                    table: &mut self.string_table,
                };
                event.unpack(stream, &mut strings);
            }
            if stream.was_error() {
                return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
            }
            if debug_sizes && ending_position != stream.bit_position() {
                return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
            }

            if unguaranteed_phase {
                self.process_queue.push_back(event);
                continue;
            }

            // reconstruct the full sequence from its low 7 bits
            let mut full_seq = seq | (self.next_recv_event_seq & !0x7F);
            if full_seq < self.next_recv_event_seq {
                full_seq += 128;
            }

            let insert_at = self
                .wait_seq_events
                .iter()
                .position(|waiting| waiting.seq_count >= full_seq)
                .unwrap_or(self.wait_seq_events.len());
            self.wait_seq_events.insert(
                insert_at,
                RecvNote {
                    event,
                    seq_count: full_seq,
                },
            );
        }

        // release every ordered event whose predecessors have all arrived
        while !self.wait_seq_events.is_empty()
            && self.wait_seq_events[0].seq_count == self.next_recv_event_seq
        {
            self.next_recv_event_seq += 1;
            let ready = self.wait_seq_events.remove(0);
            self.process_queue.push_back(ready.event);
        }
        Ok(())
    }

    /// Delivery bookkeeping for an acknowledged packet: unordered events notify at
    /// once, ordered events notify strictly in post order.
    pub(crate) fn packet_received(&mut self, note: &mut PacketNotify) {
        self.string_table.packet_received(&note.strings);
        for event_note in note.events.drain(..) {
            if event_note.event.guarantee_type() != GuaranteeType::GuaranteedOrdered {
                event_note.event.notify_delivered(true);
            } else {
                let insert_at = self
                    .notify_list
                    .iter()
                    .position(|waiting| waiting.seq_count >= event_note.seq_count)
                    .unwrap_or(self.notify_list.len());
                self.notify_list.insert(insert_at, event_note);
            }
        }
        while !self.notify_list.is_empty()
            && self.notify_list[0].seq_count == self.last_acked_event_seq + 1
        {
            self.last_acked_event_seq += 1;
            let delivered = self.notify_list.remove(0);
            delivered.event.notify_delivered(true);
        }
    }

    /// Requeue bookkeeping for a dropped packet: ordered events reinsert at their
    /// sequence position, guaranteed events go back to the head of the unordered
    /// queue, unguaranteed events are gone.
    pub(crate) fn packet_dropped(&mut self, note: &mut PacketNotify) {
        self.string_table.packet_dropped(&note.strings);
        let mut insert_at = 0usize;
        for event_note in note.events.drain(..) {
            match event_note.event.guarantee_type() {
                GuaranteeType::GuaranteedOrdered => {
                    while insert_at < self.send_queue.len()
                        && self.send_queue[insert_at].seq_count < event_note.seq_count
                    {
                        insert_at += 1;
                    }
                    self.send_queue.insert(insert_at, event_note);
                    insert_at += 1;
                }
                GuaranteeType::Guaranteed => {
                    self.unordered_send_queue.push_front(event_note);
                }
                GuaranteeType::Unguaranteed => {
                    event_note.event.notify_delivered(false);
                }
            }
        }
    }

    /// Writes this side's event class count into the connect request for negotiation.
    pub(crate) fn write_connect_request(&mut self, stream: &mut BitStream) {
        let count = self.registry.count(self.group, ClassType::Event);
        stream.write_int(count, 32);
    }

    /// Negotiates the effective event class count: the minimum of both sides, which
    /// must land on a version border.
    pub(crate) fn read_connect_request(&mut self, stream: &mut BitStream) -> Result<(), String> {
        let remote_count = stream.read_int(32);
        let my_count = self.registry.count(self.group, ClassType::Event);
        if my_count <= remote_count {
            self.event_class_count = my_count;
        } else {
            self.event_class_count = remote_count;
            if !self
                .registry
                .is_version_border(self.group, ClassType::Event, remote_count)
            {
                return Err("Version mismatch".to_owned());
            }
        }
        if self.event_class_count == 0 {
            return Err("Version mismatch".to_owned());
        }
        self.event_class_version =
            self.registry
                .class_version(self.group, ClassType::Event, self.event_class_count - 1);
        self.event_class_bit_size = ClassRegistry::bit_size(self.event_class_count);
        Ok(())
    }

    /// Writes the negotiated event class count into the connect accept.
    pub(crate) fn write_connect_accept(&mut self, stream: &mut BitStream) {
        stream.write_int(self.event_class_count, 32);
    }

    /// Validates the host's negotiated count on the initiator.
    pub(crate) fn read_connect_accept(&mut self, stream: &mut BitStream) -> Result<(), String> {
        let count = stream.read_int(32);
        let my_count = self.registry.count(self.group, ClassType::Event);
        if count > my_count || count == 0 {
            return Err("Version mismatch".to_owned());
        }
        if !self
            .registry
            .is_version_border(self.group, ClassType::Event, count)
        {
            return Err("Version mismatch".to_owned());
        }
        self.event_class_count = count;
        self.event_class_version =
            self.registry
                .class_version(self.group, ClassType::Event, count - 1);
        self.event_class_bit_size = ClassRegistry::bit_size(count);
        Ok(())
    }
}
