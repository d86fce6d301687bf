//! C64 color palette.
//!
//! The core renders palette indices (0..15); hosts that want RGBA can map
//! them through this table.

pub const PALETTE: [[u8; 4]; 16] = [
    [0x00, 0x00, 0x00, 0xFF], // 0: Black
    [0xFF, 0xFF, 0xFF, 0xFF], // 1: White
    [0x88, 0x39, 0x32, 0xFF], // 2: Red
    [0x67, 0xB6, 0xBD, 0xFF], // 3: Cyan
    [0x8B, 0x3F, 0x96, 0xFF], // 4: Purple
    [0x55, 0xA0, 0x49, 0xFF], // 5: Green
    [0x40, 0x31, 0x8D, 0xFF], // 6: Blue
    [0xBF, 0xCE, 0x72, 0xFF], // 7: Yellow
    [0x8B, 0x54, 0x29, 0xFF], // 8: Orange
    [0x57, 0x42, 0x00, 0xFF], // 9: Brown
    [0xB8, 0x69, 0x62, 0xFF], // 10: Light red
    [0x50, 0x50, 0x50, 0xFF], // 11: Dark grey
    [0x78, 0x78, 0x78, 0xFF], // 12: Grey
    [0x94, 0xE0, 0x89, 0xFF], // 13: Light green
    [0x78, 0x69, 0xC4, 0xFF], // 14: Light blue
    [0x9F, 0x9F, 0x9F, 0xFF], // 15: Light grey
];
