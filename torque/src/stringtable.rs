use crate::bitstream::BitStream;

pub const ENTRY_COUNT: usize = 1024;
pub const ENTRY_BIT_SIZE: u32 = 10;

// LRU list sentinels stored past the real entries
const LRU_HEAD: usize = ENTRY_COUNT;
const LRU_TAIL: usize = ENTRY_COUNT + 1;

/// Record of one string table slot populated by a packet, kept on that packet's
/// notify so delivery confirms the slot.
pub struct StringPacketEntry {
    pub index: u16,
    pub string: String,
}

struct Entry {
    string: Option<String>,
    receive_confirmed: bool,
    next_hash: Option<u16>,
    next_link: usize,
    prev_link: usize,
}

#[inline]
fn string_hash(value: &str) -> usize {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in value.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as usize % ENTRY_COUNT
}

/// A per-connection helper for reducing duplicated string sends. Up to 1024 strings are
/// interned into slots addressed by a 10-bit wire index; a slot's full text is only
/// transmitted until a packet carrying it is acknowledged, after which the index alone
/// suffices. Eviction is least-recently-used.
pub struct ConnectionStringTable {
    entries: Vec<Entry>,
    hash_table: Vec<Option<u16>>,
    remote_strings: Vec<String>,
}

impl ConnectionStringTable {
    pub fn new() -> ConnectionStringTable {
        let mut entries: Vec<Entry> = (0..ENTRY_COUNT + 2)
            .map(|i| Entry {
                string: None,
                receive_confirmed: false,
                next_hash: None,
                next_link: i + 1,
                prev_link: i.wrapping_sub(1),
            })
            .collect();
        entries[LRU_HEAD].next_link = 0;
        entries[LRU_HEAD].prev_link = LRU_TAIL;
        entries[LRU_TAIL].next_link = LRU_HEAD;
        entries[LRU_TAIL].prev_link = ENTRY_COUNT - 1;
        entries[0].prev_link = LRU_HEAD;
        entries[ENTRY_COUNT - 1].next_link = LRU_TAIL;

        ConnectionStringTable {
            entries,
            hash_table: vec![None; ENTRY_COUNT],
            remote_strings: vec![String::new(); ENTRY_COUNT],
        }
    }

    /// Unlinks an entry and relinks it at the back of the LRU list.
    fn push_back(&mut self, index: usize) {
        let (prev, next) = {
            let entry = &self.entries[index];
            (entry.prev_link, entry.next_link)
        };
        self.entries[prev].next_link = next;
        self.entries[next].prev_link = prev;

        let last = self.entries[LRU_TAIL].prev_link;
        self.entries[index].prev_link = last;
        self.entries[index].next_link = LRU_TAIL;
        self.entries[last].next_link = index;
        self.entries[LRU_TAIL].prev_link = index;
    }

    fn remove_from_bucket(&mut self, index: usize) {
        let old_string = match &self.entries[index].string {
            Some(s) => s.clone(),
            None => return,
        };
        let bucket = string_hash(&old_string);
        let mut walk = self.hash_table[bucket];
        if walk == Some(index as u16) {
            self.hash_table[bucket] = self.entries[index].next_hash;
            return;
        }
        while let Some(current) = walk {
            let next = self.entries[current as usize].next_hash;
            if next == Some(index as u16) {
                self.entries[current as usize].next_hash = self.entries[index].next_hash;
                return;
            }
            walk = next;
        }
    }

    /// Writes an interned string reference. If the receiver has not yet confirmed the
    /// slot, the full text follows the index and the slot is recorded on the packet's
    /// notify for confirmation on delivery.
    pub fn write(
        &mut self,
        stream: &mut BitStream,
        value: &str,
        packet_strings: &mut Vec<StringPacketEntry>,
    ) {
        let bucket = string_hash(value);
        let mut found = None;
        let mut walk = self.hash_table[bucket];
        while let Some(index) = walk {
            let entry = &self.entries[index as usize];
            if entry.string.as_deref() == Some(value) {
                found = Some(index as usize);
                break;
            }
            walk = entry.next_hash;
        }

        let index = match found {
            Some(index) => {
                self.push_back(index);
                index
            }
            None => {
                // evict the least-recently-used slot and rebind it
                let victim = self.entries[LRU_HEAD].next_link;
                self.push_back(victim);
                self.remove_from_bucket(victim);

                self.entries[victim].string = Some(value.to_owned());
                self.entries[victim].receive_confirmed = false;
                self.entries[victim].next_hash = self.hash_table[bucket];
                self.hash_table[bucket] = Some(victim as u16);
                victim
            }
        };

        stream.write_int(index as u32, ENTRY_BIT_SIZE);
        if !stream.write_flag(self.entries[index].receive_confirmed) {
            stream.write_string(value);
            packet_strings.push(StringPacketEntry {
                index: index as u16,
                string: value.to_owned(),
            });
        }
    }

    /// Reads an interned string reference, replacing the local slot when the sender
    /// included the full text.
    pub fn read(&mut self, stream: &mut BitStream) -> String {
        let index = stream.read_int(ENTRY_BIT_SIZE) as usize;
        if index >= ENTRY_COUNT {
            stream.raise_error();
            return String::new();
        }
        if !stream.read_flag() {
            self.remote_strings[index] = stream.read_string();
        }
        self.remote_strings[index].clone()
    }

    /// Marks the slots populated by a delivered packet as confirmed, unless the slot
    /// has since been rebound to a different string.
    pub fn packet_received(&mut self, packet_strings: &[StringPacketEntry]) {
        for record in packet_strings {
            let entry = &mut self.entries[record.index as usize];
            if entry.string.as_deref() == Some(record.string.as_str()) {
                entry.receive_confirmed = true;
            }
        }
    }

    /// A dropped packet confirms nothing; the text goes out again with the next use.
    pub fn packet_dropped(&mut self, _packet_strings: &[StringPacketEntry]) {}
}

/// Write-side string table context handed to event pack methods; ties interned writes
/// to the packet's notify record so delivery confirms them.
pub struct StringTableWrite<'a> {
    pub(crate) table: &'a mut ConnectionStringTable,
    pub(crate) packet_strings: &'a mut Vec<StringPacketEntry>,
}

impl<'a> StringTableWrite<'a> {
    #[inline]
    pub fn write(&mut self, stream: &mut BitStream, value: &str) {
        self.table.write(stream, value, self.packet_strings);
    }
}

/// Read-side string table context handed to event unpack methods.
pub struct StringTableRead<'a> {
    pub(crate) table: &'a mut ConnectionStringTable,
}

impl<'a> StringTableRead<'a> {
    #[inline]
    pub fn read(&mut self, stream: &mut BitStream) -> String {
        self.table.read(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(
        sender: &mut ConnectionStringTable,
        receiver: &mut ConnectionStringTable,
        value: &str,
    ) -> (String, Vec<StringPacketEntry>) {
        let mut stream = BitStream::with_size(512);
        let mut records = Vec::new();
        sender.write(&mut stream, value, &mut records);

        let mut reader = BitStream::from_bytes(stream.bytes());
        let result = receiver.read(&mut reader);
        (result, records)
    }

    #[test]
    fn test_unconfirmed_string_sends_full_text() {
        let mut sender = ConnectionStringTable::new();
        let mut receiver = ConnectionStringTable::new();

        let (value, records) = roundtrip(&mut sender, &mut receiver, "player/red");
        assert_eq!(value, "player/red");
        assert_eq!(records.len(), 1);

        // not yet confirmed: the text is repeated
        let (value, records) = roundtrip(&mut sender, &mut receiver, "player/red");
        assert_eq!(value, "player/red");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_confirmed_string_sends_index_only() {
        let mut sender = ConnectionStringTable::new();
        let mut receiver = ConnectionStringTable::new();

        let (_, records) = roundtrip(&mut sender, &mut receiver, "player/red");
        sender.packet_received(&records);

        let mut stream = BitStream::with_size(512);
        let mut records = Vec::new();
        sender.write(&mut stream, "player/red", &mut records);
        assert!(records.is_empty());
        assert_eq!(stream.bit_position(), ENTRY_BIT_SIZE as usize + 1);

        let mut reader = BitStream::from_bytes(stream.bytes());
        assert_eq!(receiver.read(&mut reader), "player/red");
    }

    #[test]
    fn test_dropped_packet_leaves_slot_unconfirmed() {
        let mut sender = ConnectionStringTable::new();
        let mut receiver = ConnectionStringTable::new();

        let (_, records) = roundtrip(&mut sender, &mut receiver, "player/red");
        sender.packet_dropped(&records);

        let (_, records) = roundtrip(&mut sender, &mut receiver, "player/red");
        assert_eq!(records.len(), 1, "text must be retransmitted until confirmed");
    }

    #[test]
    fn test_lru_eviction_reuses_oldest_slot() {
        let mut sender = ConnectionStringTable::new();
        let mut receiver = ConnectionStringTable::new();

        // fill every slot, confirming each
        for i in 0..ENTRY_COUNT {
            let (_, records) = roundtrip(&mut sender, &mut receiver, &format!("mission/{}", i));
            sender.packet_received(&records);
        }

        // the 1025th distinct string evicts the least recently used slot (mission/0)
        let (value, records) = roundtrip(&mut sender, &mut receiver, "mission/overflow");
        assert_eq!(value, "mission/overflow");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].index, 0);

        // the receiver replaced its copy in that slot
        let mut stream = BitStream::with_size(512);
        let mut more = Vec::new();
        sender.packet_received(&records);
        sender.write(&mut stream, "mission/overflow", &mut more);
        let mut reader = BitStream::from_bytes(stream.bytes());
        assert_eq!(receiver.read(&mut reader), "mission/overflow");

        // mission/0 is no longer resident and re-interns into a different, evicted slot
        let (value, records) = roundtrip(&mut sender, &mut receiver, "mission/0");
        assert_eq!(value, "mission/0");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].index, 1);
    }

    #[test]
    fn test_stale_confirmation_ignored_after_rebind() {
        let mut sender = ConnectionStringTable::new();
        let mut receiver = ConnectionStringTable::new();

        // fill the table so the next write rebinds slot 0
        for i in 0..ENTRY_COUNT {
            let (_, _r) = roundtrip(&mut sender, &mut receiver, &format!("mission/{}", i));
        }
        let (_, old_records) = roundtrip(&mut sender, &mut receiver, "alpha");
        assert_eq!(old_records[0].index, 0);

        // the slot gets rebound before the ack for "alpha" arrives
        for i in 0..ENTRY_COUNT {
            let (_, _r) = roundtrip(&mut sender, &mut receiver, &format!("refill/{}", i));
        }
        sender.packet_received(&old_records);

        // "alpha" must still transmit its text: the confirmation was for a stale binding
        let (_, records) = roundtrip(&mut sender, &mut receiver, "alpha");
        assert_eq!(records.len(), 1);
    }
}
