//! Unscaled VRAM stores one `u32` word per pixel: the low 16 bits are the console's
//! ABGR1555 value, bits 16..31 carry two extra low-order bits per channel so that
//! scaled (RGBA8) content survives a resolve round trip without banding.

/// 24-bit console color, `0x00BBGGRR`.
pub type FbColor = u32;

pub const VRAM_LSB_SHIFT: u32 = 16;

pub const fn fbcolor_to_rgba8(color: FbColor) -> u32 {
    color & 0xfff8_f8f8
}

pub fn fbcolor_to_rgba32f(color: FbColor) -> [f32; 4] {
    let channel = |shift: u32| ((color >> shift) & 0xf8) as f32 * (1.0 / 255.0);
    // Mask bit is always cleared.
    [channel(0), channel(8), channel(16), 0.0]
}

/// Expands a VRAM word into packed RGBA8 (`r` in the low byte). Alpha carries the
/// mask bit.
pub const fn vram_word_to_rgba8(word: u32) -> u32 {
    let mut rgba = 0u32;
    let mut channel = 0;
    while channel < 3 {
        let msb = (word >> (5 * channel)) & 31;
        let lsb = (word >> (VRAM_LSB_SHIFT + 5 * channel)) & 31;
        let ten_bit = (msb << 5) | lsb;
        rgba |= (ten_bit >> 2) << (8 * channel);
        channel += 1;
    }
    if word & 0x8000 != 0 {
        rgba |= 0xff00_0000;
    }
    rgba
}

/// Packs RGBA8 back into a VRAM word. Alpha at or above one half sets the mask bit.
pub const fn rgba8_to_vram_word(rgba: u32) -> u32 {
    let mut word = 0u32;
    let mut channel = 0;
    while channel < 3 {
        let ten_bit = ((rgba >> (8 * channel)) & 0xff) << 2;
        word |= (ten_bit >> 5) << (5 * channel);
        word |= (ten_bit & 31) << (VRAM_LSB_SHIFT + 5 * channel);
        channel += 1;
    }
    if (rgba >> 24) >= 0x80 {
        word |= 0x8000;
    }
    word
}
