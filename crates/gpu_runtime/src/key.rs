use std::marker::PhantomData;

const SLOT_BITS: u32 = 32;
const GEN_BITS: u32 = 32;

const SLOT_SHIFT: u32 = 0;
const GEN_SHIFT: u32 = SLOT_BITS;

const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const GEN_MASK: u64 = (1 << GEN_BITS) - 1;

#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Id<Tag, Repr> {
    raw: Repr,
    _marker: PhantomData<Tag>,
}

impl<Tag, Repr: Copy> Copy for Id<Tag, Repr> {}

impl<Tag, Repr: Copy> Clone for Id<Tag, Repr> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Tag, Repr> Id<Tag, Repr> {
    pub(crate) const fn new(raw: Repr) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) const fn raw(self) -> Repr
    where
        Repr: Copy,
    {
        self.raw
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum GenerationTag {}
pub type GenerationId = Id<GenerationTag, u32>;

#[derive(Debug, PartialEq, Eq)]
pub enum SlotTag {}
pub type SlotId = Id<SlotTag, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey(u64);

impl ResourceKey {
    /// ResourceKey:
    /// | generation (32) | slot_index (32) |
    /// 63              32 31              0
    pub fn new(generation: GenerationId, slot: SlotId) -> Self {
        let generation = generation.raw() as u64;
        let slot = slot.raw() as u64;
        ResourceKey((generation & GEN_MASK) << GEN_SHIFT | (slot & SLOT_MASK) << SLOT_SHIFT)
    }

    pub fn generation(&self) -> GenerationId {
        GenerationId::new(((self.0 >> GEN_SHIFT) & GEN_MASK) as u32)
    }

    pub fn slot(&self) -> SlotId {
        SlotId::new(((self.0 >> SLOT_SHIFT) & SLOT_MASK) as u32)
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum ImageTag {}
/// Device image owned by whoever created it; stale after `release_image`.
pub type ImageHandle = Id<ImageTag, ResourceKey>;

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum BufferTag {}
pub type BufferHandle = Id<BufferTag, ResourceKey>;

impl ImageHandle {
    pub fn key(self) -> ResourceKey {
        self.raw()
    }
}

impl BufferHandle {
    pub fn key(self) -> ResourceKey {
        self.raw()
    }
}
