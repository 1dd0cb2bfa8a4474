use std::fmt;

use crate::key::{GenerationId, ResourceKey, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    OutOfSlots,
    InvalidSlot,
    GenerationMismatch,
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::OutOfSlots => write!(f, "no free slot left"),
            SlotError::InvalidSlot => write!(f, "slot index out of range"),
            SlotError::GenerationMismatch => write!(f, "slot was released and reused"),
        }
    }
}

impl std::error::Error for SlotError {}

/// Resource storage addressed by generational keys. Releasing a slot bumps its
/// generation so keys handed out earlier stop resolving.
pub(crate) struct HandleTable<T> {
    // generations.len() == entries.len() == pool.next_slot
    pool: FreeSlotPool,
    generations: Vec<GenerationId>,
    entries: Vec<Option<T>>,
}

impl<T> HandleTable<T> {
    pub(crate) fn new(total_slots: u32) -> Self {
        Self {
            pool: FreeSlotPool::new(total_slots),
            generations: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> Result<ResourceKey, SlotError> {
        let Some(slot) = self.pool.alloc() else {
            return Err(SlotError::OutOfSlots);
        };
        let index = slot.raw() as usize;
        if index == self.entries.len() {
            self.generations.push(GenerationId::new(0));
            self.entries.push(None);
        }
        self.entries[index] = Some(value);
        Ok(ResourceKey::new(self.generations[index], slot))
    }

    fn index(&self, key: ResourceKey) -> Result<usize, SlotError> {
        let index = key.slot().raw() as usize;
        let Some(current_generation) = self.generations.get(index).copied() else {
            return Err(SlotError::InvalidSlot);
        };
        if current_generation != key.generation() {
            return Err(SlotError::GenerationMismatch);
        }
        Ok(index)
    }

    pub(crate) fn get(&self, key: ResourceKey) -> Result<&T, SlotError> {
        let index = self.index(key)?;
        self.entries[index].as_ref().ok_or(SlotError::GenerationMismatch)
    }

    pub(crate) fn get_mut(&mut self, key: ResourceKey) -> Result<&mut T, SlotError> {
        let index = self.index(key)?;
        self.entries[index].as_mut().ok_or(SlotError::GenerationMismatch)
    }

    pub(crate) fn remove(&mut self, key: ResourceKey) -> Result<T, SlotError> {
        let index = self.index(key)?;
        let Some(value) = self.entries[index].take() else {
            return Err(SlotError::GenerationMismatch);
        };
        let generation = self.generations[index].raw().wrapping_add(1);
        self.generations[index] = GenerationId::new(generation);
        self.pool.free(key.slot());
        Ok(value)
    }

    pub(crate) fn len(&self) -> u32 {
        self.pool.allocated()
    }
}

#[derive(Debug, Default)]
struct FreeSlotPool {
    total_slots: u32,
    next_slot: u32,
    freelist: Vec<SlotId>,
}

impl FreeSlotPool {
    const fn new(total_slots: u32) -> Self {
        Self {
            total_slots,
            next_slot: 0,
            freelist: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Option<SlotId> {
        if let Some(slot) = self.freelist.pop() {
            return Some(slot);
        }

        if self.next_slot >= self.total_slots {
            return None;
        }

        let slot = self.next_slot;
        self.next_slot = self.next_slot.checked_add(1).expect("slot id overflow");
        Some(SlotId::new(slot))
    }

    fn free(&mut self, slot: SlotId) {
        self.freelist.push(slot);
    }

    fn allocated(&self) -> u32 {
        let reused = self.freelist.len().min(self.next_slot as usize) as u32;
        self.next_slot - reused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_key_goes_stale() {
        let mut table = HandleTable::new(4);
        let key = table.insert("vram").expect("insert");
        assert_eq!(table.remove(key), Ok("vram"));
        assert_eq!(table.get(key), Err(SlotError::GenerationMismatch));
        assert_eq!(table.remove(key), Err(SlotError::GenerationMismatch));
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let mut table = HandleTable::new(1);
        let first = table.insert(1u32).expect("insert");
        assert_eq!(table.insert(2), Err(SlotError::OutOfSlots));
        table.remove(first).expect("remove");
        let second = table.insert(3).expect("reinsert");
        assert_eq!(second.slot(), first.slot());
        assert_eq!(
            second.generation().raw(),
            first.generation().raw().wrapping_add(1)
        );
        assert_eq!(table.get(second), Ok(&3));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn key_from_unknown_slot_is_invalid() {
        let table: HandleTable<u8> = HandleTable::new(8);
        let key = ResourceKey::new(GenerationId::new(0), SlotId::new(5));
        assert_eq!(table.get(key), Err(SlotError::InvalidSlot));
    }
}
