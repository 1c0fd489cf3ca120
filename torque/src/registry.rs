use crate::bitstream::next_binary_log2;
use crate::event::NetEvent;
use crate::ghost;
use crate::object::NetObjectHandle;
use hashbrown::HashMap;
use std::rc::Rc;

/// Class types partition the class-index space so objects and events are numbered
/// independently, keeping the wire fields as narrow as possible.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ClassType {
    Object,
    Event,
}

/// Class groups partition network services; a connection belongs to one group and can
/// only transmit classes registered in that group.
pub const CLASS_GROUP_GAME: u32 = 0;
pub const CLASS_GROUP_COMMUNITY: u32 = 1;
pub const CLASS_GROUP_MASTER: u32 = 2;
const MAX_CLASS_GROUPS: usize = 32;

pub const CLASS_GROUP_GAME_MASK: u32 = 1 << CLASS_GROUP_GAME;
pub const CLASS_GROUP_COMMUNITY_MASK: u32 = 1 << CLASS_GROUP_COMMUNITY;
pub const CLASS_GROUP_MASTER_MASK: u32 = 1 << CLASS_GROUP_MASTER;
pub const CLASS_GROUP_ALL_MASK: u32 = !0;

pub type EventCtor = fn() -> Box<dyn NetEvent>;
pub type ObjectCtor = fn() -> NetObjectHandle;

#[derive(Clone, Copy)]
enum ClassCtor {
    Event(EventCtor),
    Object(ObjectCtor),
}

#[derive(Clone, Copy)]
struct ClassEntry {
    name: &'static str,
    version: u32,
    ctor: ClassCtor,
}

struct Registration {
    class_type: ClassType,
    group_mask: u32,
    entry: ClassEntry,
}

/// Collects class registrations before the registry is frozen. The three ghost-control
/// events are seeded first so every group shares their indices.
pub struct ClassRegistryBuilder {
    registrations: Vec<Registration>,
}

impl ClassRegistryBuilder {
    pub fn new() -> ClassRegistryBuilder {
        let mut builder = ClassRegistryBuilder {
            registrations: Vec::new(),
        };
        ghost::register_control_events(&mut builder);
        builder
    }

    pub fn register_event(
        &mut self,
        name: &'static str,
        group_mask: u32,
        version: u32,
        ctor: EventCtor,
    ) -> &mut Self {
        self.registrations.push(Registration {
            class_type: ClassType::Event,
            group_mask,
            entry: ClassEntry {
                name,
                version,
                ctor: ClassCtor::Event(ctor),
            },
        });
        self
    }

    pub fn register_object(
        &mut self,
        name: &'static str,
        group_mask: u32,
        version: u32,
        ctor: ObjectCtor,
    ) -> &mut Self {
        self.registrations.push(Registration {
            class_type: ClassType::Object,
            group_mask,
            entry: ClassEntry {
                name,
                version,
                ctor: ClassCtor::Object(ctor),
            },
        });
        self
    }

    /// Freezes the catalogue. Classes are sorted by ascending version within each
    /// (group, type), which assigns every class its stable per-group index.
    pub fn freeze(self) -> Rc<ClassRegistry> {
        let mut tables: Vec<[Vec<ClassEntry>; 2]> = (0..MAX_CLASS_GROUPS)
            .map(|_| [Vec::new(), Vec::new()])
            .collect();

        for registration in &self.registrations {
            for group in 0..MAX_CLASS_GROUPS {
                if registration.group_mask & (1 << group) == 0 {
                    continue;
                }
                tables[group][type_slot(registration.class_type)].push(registration.entry);
            }
        }
        for group_tables in tables.iter_mut() {
            for table in group_tables.iter_mut() {
                table.sort_by_key(|entry| entry.version);
            }
        }

        let mut index = HashMap::new();
        for (group, group_tables) in tables.iter().enumerate() {
            for (slot, table) in group_tables.iter().enumerate() {
                for (class_index, entry) in table.iter().enumerate() {
                    index.insert(
                        (group as u32, slot, entry.name),
                        class_index as u32,
                    );
                }
            }
        }

        Rc::new(ClassRegistry { tables, index })
    }
}

#[inline]
fn type_slot(class_type: ClassType) -> usize {
    match class_type {
        ClassType::Object => 0,
        ClassType::Event => 1,
    }
}

/// The frozen, read-only catalogue of networkable classes. Built once at startup,
/// before the first interface is constructed; class indices are stable for the life
/// of the process.
pub struct ClassRegistry {
    tables: Vec<[Vec<ClassEntry>; 2]>,
    index: HashMap<(u32, usize, &'static str), u32>,
}

impl ClassRegistry {
    #[inline]
    pub fn count(&self, group: u32, class_type: ClassType) -> u32 {
        self.tables[group as usize][type_slot(class_type)].len() as u32
    }

    /// Width of the wire field for a negotiated class count.
    #[inline]
    pub fn bit_size(count: u32) -> u32 {
        next_binary_log2(count)
    }

    /// True when truncating the class table to `count` lands on a version boundary,
    /// i.e. no version's classes are split across the cut.
    pub fn is_version_border(&self, group: u32, class_type: ClassType, count: u32) -> bool {
        let table = &self.tables[group as usize][type_slot(class_type)];
        let count = count as usize;
        if count == 0 || count >= table.len() {
            return true;
        }
        table[count].version != table[count - 1].version
    }

    pub fn class_version(&self, group: u32, class_type: ClassType, class_index: u32) -> u32 {
        self.tables[group as usize][type_slot(class_type)][class_index as usize].version
    }

    pub fn class_name(&self, group: u32, class_type: ClassType, class_index: u32) -> &'static str {
        self.tables[group as usize][type_slot(class_type)][class_index as usize].name
    }

    pub fn event_index(&self, group: u32, name: &'static str) -> Option<u32> {
        self.index
            .get(&(group, type_slot(ClassType::Event), name))
            .copied()
    }

    pub fn object_index(&self, group: u32, name: &'static str) -> Option<u32> {
        self.index
            .get(&(group, type_slot(ClassType::Object), name))
            .copied()
    }

    pub fn create_event(&self, group: u32, class_index: u32) -> Option<Box<dyn NetEvent>> {
        let table = &self.tables[group as usize][type_slot(ClassType::Event)];
        match table.get(class_index as usize)?.ctor {
            ClassCtor::Event(ctor) => Some(ctor()),
            ClassCtor::Object(_) => None,
        }
    }

    pub fn create_object(&self, group: u32, class_index: u32) -> Option<NetObjectHandle> {
        let table = &self.tables[group as usize][type_slot(ClassType::Object)];
        match table.get(class_index as usize)?.ctor {
            ClassCtor::Object(ctor) => Some(ctor()),
            ClassCtor::Event(_) => None,
        }
    }
}
