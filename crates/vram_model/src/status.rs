use bitflags::bitflags;

use crate::{Domain, Stage};

/// Which domain holds the authoritative copy of a block.
///
/// Stored in the two low bits of [`StatusFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Ownership {
    UnscaledOnly = 0,
    UnscaledPrefer = 1,
    ScaledOnly = 2,
    ScaledPrefer = 3,
}

impl Ownership {
    pub const fn from_bits(bits: u16) -> Self {
        match bits & StatusFlags::OWNERSHIP.bits() {
            0 => Ownership::UnscaledOnly,
            1 => Ownership::UnscaledPrefer,
            2 => Ownership::ScaledOnly,
            _ => Ownership::ScaledPrefer,
        }
    }

    /// `Only` ownership of `domain`, i.e. the other domain is stale.
    pub const fn only(domain: Domain) -> Self {
        match domain {
            Domain::Unscaled => Ownership::UnscaledOnly,
            Domain::Scaled => Ownership::ScaledOnly,
        }
    }

    pub const fn prefer(domain: Domain) -> Self {
        match domain {
            Domain::Unscaled => Ownership::UnscaledPrefer,
            Domain::Scaled => Ownership::ScaledPrefer,
        }
    }

    /// True when the block's copy in `domain` is current.
    pub const fn is_valid_in(self, domain: Domain) -> bool {
        !matches!(
            (self, domain),
            (Ownership::ScaledOnly, Domain::Unscaled) | (Ownership::UnscaledOnly, Domain::Scaled)
        )
    }

    pub const fn favors_unscaled(self) -> bool {
        matches!(self, Ownership::UnscaledOnly | Ownership::UnscaledPrefer)
    }
}

bitflags! {
    /// Per-block status word.
    ///
    /// | bits | meaning |
    /// |---|---|
    /// | 0..2 | ownership (`Ownership`) |
    /// | 2..14 | {compute, transfer, fragment} x {read, write} x {unscaled (FB), scaled (SFB)} |
    /// | 14 | texture read in the open render pass |
    /// | 15 | advisory: content came from a CPU texture upload |
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u16 {
        const OWNERSHIP = 0b11;

        const COMPUTE_FB_READ = 1 << 2;
        const COMPUTE_FB_WRITE = 1 << 3;
        const COMPUTE_SFB_READ = 1 << 4;
        const COMPUTE_SFB_WRITE = 1 << 5;

        const TRANSFER_FB_READ = 1 << 6;
        const TRANSFER_SFB_READ = 1 << 7;
        const TRANSFER_FB_WRITE = 1 << 8;
        const TRANSFER_SFB_WRITE = 1 << 9;

        const FRAGMENT_SFB_READ = 1 << 10;
        const FRAGMENT_SFB_WRITE = 1 << 11;
        const FRAGMENT_FB_READ = 1 << 12;
        const FRAGMENT_FB_WRITE = 1 << 13;

        const TEXTURE_READ = 1 << 14;
        const TEXTURE_LOADED = 1 << 15;

        const FB_READ = Self::COMPUTE_FB_READ.bits()
            | Self::TRANSFER_FB_READ.bits()
            | Self::FRAGMENT_FB_READ.bits();
        const FB_WRITE = Self::COMPUTE_FB_WRITE.bits()
            | Self::TRANSFER_FB_WRITE.bits()
            | Self::FRAGMENT_FB_WRITE.bits();
        const SFB_READ = Self::COMPUTE_SFB_READ.bits()
            | Self::TRANSFER_SFB_READ.bits()
            | Self::FRAGMENT_SFB_READ.bits();
        const SFB_WRITE = Self::COMPUTE_SFB_WRITE.bits()
            | Self::TRANSFER_SFB_WRITE.bits()
            | Self::FRAGMENT_SFB_WRITE.bits();

        const COMPUTE_READ = Self::COMPUTE_FB_READ.bits() | Self::COMPUTE_SFB_READ.bits();
        const COMPUTE_WRITE = Self::COMPUTE_FB_WRITE.bits() | Self::COMPUTE_SFB_WRITE.bits();
        const TRANSFER_READ = Self::TRANSFER_FB_READ.bits() | Self::TRANSFER_SFB_READ.bits();
        const TRANSFER_WRITE = Self::TRANSFER_FB_WRITE.bits() | Self::TRANSFER_SFB_WRITE.bits();
        const FRAGMENT_READ = Self::FRAGMENT_FB_READ.bits() | Self::FRAGMENT_SFB_READ.bits();
        const FRAGMENT_WRITE = Self::FRAGMENT_FB_WRITE.bits() | Self::FRAGMENT_SFB_WRITE.bits();

        const ACCESS = Self::FB_READ.bits()
            | Self::FB_WRITE.bits()
            | Self::SFB_READ.bits()
            | Self::SFB_WRITE.bits();
    }
}

impl StatusFlags {
    pub const fn ownership(self) -> Ownership {
        Ownership::from_bits(self.bits())
    }

    pub fn set_ownership(&mut self, ownership: Ownership) {
        *self = self.with_ownership(ownership);
    }

    pub const fn with_ownership(self, ownership: Ownership) -> Self {
        Self::from_bits_retain((self.bits() & !Self::OWNERSHIP.bits()) | ownership as u16)
    }

    /// The status bits of a fresh block with the given ownership.
    pub const fn owned(ownership: Ownership) -> Self {
        Self::from_bits_retain(ownership as u16)
    }

    /// Access flags only, ownership stripped.
    pub const fn access(self) -> Self {
        Self::from_bits_retain(self.bits() & !Self::OWNERSHIP.bits())
    }

    pub const fn read(stage: Stage, domain: Domain) -> Self {
        match (stage, domain) {
            (Stage::Compute, Domain::Unscaled) => Self::COMPUTE_FB_READ,
            (Stage::Compute, Domain::Scaled) => Self::COMPUTE_SFB_READ,
            (Stage::Transfer, Domain::Unscaled) => Self::TRANSFER_FB_READ,
            (Stage::Transfer, Domain::Scaled) => Self::TRANSFER_SFB_READ,
            (Stage::Fragment | Stage::FragmentTexture, Domain::Unscaled) => Self::FRAGMENT_FB_READ,
            (Stage::Fragment | Stage::FragmentTexture, Domain::Scaled) => Self::FRAGMENT_SFB_READ,
        }
    }

    pub const fn write(stage: Stage, domain: Domain) -> Self {
        match (stage, domain) {
            (Stage::Compute, Domain::Unscaled) => Self::COMPUTE_FB_WRITE,
            (Stage::Compute, Domain::Scaled) => Self::COMPUTE_SFB_WRITE,
            (Stage::Transfer, Domain::Unscaled) => Self::TRANSFER_FB_WRITE,
            (Stage::Transfer, Domain::Scaled) => Self::TRANSFER_SFB_WRITE,
            (Stage::Fragment | Stage::FragmentTexture, Domain::Unscaled) => Self::FRAGMENT_FB_WRITE,
            (Stage::Fragment | Stage::FragmentTexture, Domain::Scaled) => {
                Self::FRAGMENT_SFB_WRITE
            }
        }
    }

    pub const fn domain_reads(domain: Domain) -> Self {
        match domain {
            Domain::Unscaled => Self::FB_READ,
            Domain::Scaled => Self::SFB_READ,
        }
    }

    pub const fn domain_writes(domain: Domain) -> Self {
        match domain {
            Domain::Unscaled => Self::FB_WRITE,
            Domain::Scaled => Self::SFB_WRITE,
        }
    }

    pub const fn texture_read(self) -> bool {
        self.contains(Self::TEXTURE_READ)
    }

    pub const fn texture_loaded(self) -> bool {
        self.contains(Self::TEXTURE_LOADED)
    }

    /// Expands a barrier mask so that waiting on a stage's writes also retires its
    /// reads, which is what a global execution+memory barrier guarantees.
    pub fn barrier_closure(self) -> Self {
        let mut expanded = self;
        for (write, read) in [
            (Self::COMPUTE_WRITE, Self::COMPUTE_READ),
            (Self::TRANSFER_WRITE, Self::TRANSFER_READ),
            (Self::FRAGMENT_WRITE, Self::FRAGMENT_READ),
        ] {
            if self.intersects(write) {
                expanded |= write | read;
            }
            if self.intersects(read) {
                expanded |= read;
            }
        }
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_round_trips_through_status_word() {
        let mut flags = StatusFlags::COMPUTE_FB_READ | StatusFlags::TEXTURE_LOADED;
        for ownership in [
            Ownership::UnscaledOnly,
            Ownership::UnscaledPrefer,
            Ownership::ScaledOnly,
            Ownership::ScaledPrefer,
        ] {
            flags.set_ownership(ownership);
            assert_eq!(flags.ownership(), ownership);
            assert!(flags.contains(StatusFlags::COMPUTE_FB_READ | StatusFlags::TEXTURE_LOADED));
        }
    }

    #[test]
    fn status_bits_keep_their_wire_positions() {
        assert_eq!(StatusFlags::FRAGMENT_SFB_READ.bits(), 1 << 10);
        assert_eq!(StatusFlags::TEXTURE_READ.bits(), 1 << 14);
        assert_eq!(StatusFlags::TEXTURE_LOADED.bits(), 1 << 15);
        assert_eq!(StatusFlags::ACCESS.bits(), 0x3ffc);
        assert_eq!(Ownership::ScaledPrefer as u16, 3);
    }

    #[test]
    fn stage_lookups_pick_domain_specific_bits() {
        assert_eq!(
            StatusFlags::write(Stage::Transfer, Domain::Scaled),
            StatusFlags::TRANSFER_SFB_WRITE
        );
        assert_eq!(
            StatusFlags::read(Stage::FragmentTexture, Domain::Unscaled),
            StatusFlags::FRAGMENT_FB_READ
        );
        assert!(StatusFlags::domain_writes(Domain::Scaled).contains(StatusFlags::FRAGMENT_SFB_WRITE));
    }

    #[test]
    fn write_barrier_retires_reads_of_same_stage() {
        let closure = StatusFlags::COMPUTE_FB_WRITE.barrier_closure();
        assert_eq!(closure, StatusFlags::COMPUTE_WRITE | StatusFlags::COMPUTE_READ);
        let closure = StatusFlags::FRAGMENT_SFB_READ.barrier_closure();
        assert_eq!(closure, StatusFlags::FRAGMENT_READ);
    }

    #[test]
    fn staleness_depends_on_requested_domain() {
        assert!(!Ownership::ScaledOnly.is_valid_in(Domain::Unscaled));
        assert!(Ownership::ScaledPrefer.is_valid_in(Domain::Unscaled));
        assert!(!Ownership::UnscaledOnly.is_valid_in(Domain::Scaled));
        assert!(Ownership::UnscaledPrefer.favors_unscaled());
    }
}
