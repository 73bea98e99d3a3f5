//! Kernel object arena
//!
//! Objects live in a flat vector of slots with a free list. Each slot keeps
//! a generation counter so ids of destroyed objects never resolve again, and
//! each occupied slot carries the back-links `(pd, cap)` of every directory
//! entry that references it. The number of back-links is the object's
//! reference count.

use alloc::vec::Vec;

use super::{CapId, KernelObject, ObjectId, ObjectKind};
use crate::error::{KernelResult, Resource};
use crate::irq::UserIrq;
use crate::pd::ProtectionDomain;
use crate::sched::Thread;
use crate::signal::{SignalContext, SignalReceiver};
use crate::vm::VirtualMachine;

/// An occupied arena slot
pub struct ObjectEntry {
    /// The object itself
    pub object: KernelObject,
    owner: Option<ObjectId>,
    links: Vec<(ObjectId, CapId)>,
}

impl ObjectEntry {
    /// Domain that constructed the object, `None` for boot objects
    pub fn owner(&self) -> Option<ObjectId> {
        self.owner
    }

    /// Directory entries referencing this object
    pub fn links(&self) -> &[(ObjectId, CapId)] {
        &self.links
    }

    pub(crate) fn take_links(&mut self) -> Vec<(ObjectId, CapId)> {
        core::mem::take(&mut self.links)
    }
}

struct Slot {
    generation: u32,
    entry: Option<ObjectEntry>,
}

/// Arena of all kernel objects
pub struct ObjectTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl ObjectTable {
    /// Create an empty table holding at most `capacity` objects
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no object is alive
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Place an object in a free slot.
    pub fn insert(&mut self, object: KernelObject, owner: Option<ObjectId>) -> KernelResult<ObjectId> {
        let entry = ObjectEntry {
            object,
            owner,
            links: Vec::new(),
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => return Err(Resource::Objects.into()),
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.live += 1;
        Ok(ObjectId::new(index, slot.generation))
    }

    /// Take an object out of the arena, retiring its id.
    ///
    /// Back-links must already be gone; the caller is responsible for
    /// removing the directory entries first.
    pub fn remove(&mut self, id: ObjectId) -> Option<ObjectEntry> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        self.live -= 1;

        // A slot whose generation would wrap is retired for good.
        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free.push(id.index());
            }
            None => log::warn!("retiring object slot {} after generation wrap", id.index()),
        }
        Some(entry)
    }

    /// Look up a live object
    pub fn get(&self, id: ObjectId) -> Option<&ObjectEntry> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Look up a live object mutably
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectEntry> {
        self.slot_mut(id)?.entry.as_mut()
    }

    fn slot_mut(&mut self, id: ObjectId) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        (slot.generation == id.generation()).then_some(slot)
    }

    /// Whether `id` names a live object
    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Kind of a live object
    pub fn kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.get(id).map(|e| e.object.kind())
    }

    /// Number of directory entries referencing `id`
    pub fn ref_count(&self, id: ObjectId) -> usize {
        self.get(id).map_or(0, |e| e.links.len())
    }

    pub(crate) fn add_link(&mut self, id: ObjectId, pd: ObjectId, cap: CapId) -> bool {
        match self.get_mut(id) {
            Some(entry) => {
                entry.links.push((pd, cap));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_link(&mut self, id: ObjectId, pd: ObjectId, cap: CapId) -> bool {
        let Some(entry) = self.get_mut(id) else {
            return false;
        };
        match entry.links.iter().position(|&link| link == (pd, cap)) {
            Some(at) => {
                entry.links.swap_remove(at);
                true
            }
            None => false,
        }
    }

    /// Iterate over all live objects
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (ObjectId::new(index as u32, slot.generation), entry))
        })
    }

    /// Ids of all live objects of one kind
    pub fn ids_of(&self, kind: ObjectKind) -> Vec<ObjectId> {
        self.iter()
            .filter(|(_, entry)| entry.object.kind() == kind)
            .map(|(id, _)| id)
            .collect()
    }
}

macro_rules! typed_access {
    ($($variant:ident => $ty:ty, $get:ident, $get_mut:ident;)*) => {
        impl ObjectTable {
            $(
                #[doc = concat!("Borrow a live `", stringify!($variant), "` object")]
                pub fn $get(&self, id: ObjectId) -> Option<&$ty> {
                    match self.get(id).map(|e| &e.object) {
                        Some(KernelObject::$variant(object)) => Some(object),
                        _ => None,
                    }
                }

                #[doc = concat!("Mutably borrow a live `", stringify!($variant), "` object")]
                pub fn $get_mut(&mut self, id: ObjectId) -> Option<&mut $ty> {
                    match self.get_mut(id).map(|e| &mut e.object) {
                        Some(KernelObject::$variant(object)) => Some(object),
                        _ => None,
                    }
                }
            )*
        }
    };
}

typed_access! {
    Pd => ProtectionDomain, pd, pd_mut;
    Thread => Thread, thread, thread_mut;
    SignalReceiver => SignalReceiver, receiver, receiver_mut;
    SignalContext => SignalContext, context, context_mut;
    Irq => UserIrq, irq, irq_mut;
    Vm => VirtualMachine, vm, vm_mut;
}
