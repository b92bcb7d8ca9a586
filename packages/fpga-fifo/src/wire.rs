// Command words exchanged with the FPGA
//
// A session starts with a two-word initiation command carrying the requested
// transfer value, then every received packet is acknowledged with a fixed
// two-word continue command so the hardware keeps streaming.

/// Size of one transfer word in bytes
pub const WORD_SIZE: usize = 4;

/// Words per unit of requested transfer size
pub const WORDS_PER_UNIT: usize = 6;

/// Opcode in the low half of the initiation command's first word
pub const INIT_OPCODE: u32 = 0x013C;

/// Marker in the high half of the second command word
pub const COMMAND_MARKER: u32 = 0x3E00;

/// Continue ("keep streaming") command, sent after every successful receive
pub const CONTINUE_COMMAND: [u32; 2] = [0x0000_023C, 0x3E00_0000];

/// Word index of the hardware sequence counter within a packet
pub const SEQUENCE_WORD: usize = 5;

/// Word index of the marker that flags a packet as exempt from the sequence check
pub const SEQUENCE_FLAG_WORD: usize = 11;

/// Modulus of the hardware sequence counter
pub const SEQUENCE_ROLLOVER: u32 = 11_184_800;

/// Build the initiation command for a requested transfer value
///
/// The low and high halves of `value` are split across the two words:
/// `word0 = low16 << 16 | 0x013C`, `word1 = 0x3E00 << 16 | high16`.
pub fn init_command(value: u32) -> [u32; 2] {
    let low16 = value & 0xFFFF;
    let high16 = (value >> 16) & 0xFFFF;
    [(low16 << 16) | INIT_OPCODE, (COMMAND_MARKER << 16) | high16]
}

/// Recover the requested value from an initiation command, if it is one
pub fn decode_init_command(words: &[u32]) -> Option<u32> {
    match words {
        [word0, word1] if word0 & 0xFFFF == INIT_OPCODE && word1 >> 16 == COMMAND_MARKER => {
            Some((word0 >> 16) | ((word1 & 0xFFFF) << 16))
        }
        _ => None,
    }
}

pub fn is_continue_command(words: &[u32]) -> bool {
    words == CONTINUE_COMMAND
}

/// Geometry of one packet for a given requested word count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub requested_word_count: u32,
    pub words_per_unit: usize,
    pub word_size: usize,
}

impl PacketLayout {
    pub fn new(requested_word_count: u32) -> Self {
        Self {
            requested_word_count,
            words_per_unit: WORDS_PER_UNIT,
            word_size: WORD_SIZE,
        }
    }

    pub fn with_geometry(requested_word_count: u32, words_per_unit: usize, word_size: usize) -> Self {
        Self {
            requested_word_count,
            words_per_unit,
            word_size,
        }
    }

    /// Words transferred per receive
    pub fn words(&self) -> usize {
        self.requested_word_count as usize * self.words_per_unit
    }

    /// Bytes written into the ring per receive
    pub fn bytes(&self) -> usize {
        self.words() * self.word_size
    }
}

/// Decode little-endian packet bytes back into words, ignoring a trailing partial word
pub fn words_from_le_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(WORD_SIZE)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

/// Encode words into little-endian bytes, as the DMA engine lays them out
pub fn write_words_le(words: &[u32], out: &mut [u8]) {
    for (word, chunk) in words.iter().zip(out.chunks_exact_mut(WORD_SIZE)) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

/// Render words as `0x%08x` separated by spaces, for diagnostics
pub fn format_words(words: &[u32]) -> String {
    words
        .iter()
        .map(|w| format!("0x{:08x}", w))
        .collect::<Vec<_>>()
        .join(" ")
}
