//! Script Decoder
//!
//! Decodes hex-encoded Bitcoin scripts and extracts the data pushed after an
//! annotation opcode (`OP_RETURN`). Input comes from an untrusted provider, so
//! every read is bounds-checked and malformed data yields "no payload".

/// `OP_RETURN` opcode
pub const OP_RETURN: u8 = 0x6a;

/// Largest opcode that is itself a direct push length
pub const OP_PUSHBYTES_MAX: u8 = 75;

/// Next byte holds the push length
pub const OP_PUSHDATA1: u8 = 0x4c;

/// Next 2 bytes (little-endian) hold the push length
pub const OP_PUSHDATA2: u8 = 0x4d;

/// Next 4 bytes (little-endian) hold the push length
pub const OP_PUSHDATA4: u8 = 0x4e;

/// Decode a hex string into script bytes
///
/// Non-hex characters are stripped and a trailing odd nibble is dropped.
///
/// # Returns
/// `None` if nothing decodable remains
pub fn decode_script_hex(script_hex: &str) -> Option<Vec<u8>> {
    let mut clean: String = script_hex.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if clean.len() % 2 == 1 {
        clean.pop();
    }
    if clean.is_empty() {
        return None;
    }
    hex::decode(clean).ok()
}

/// Result of reading one instruction while accumulating push data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push<'a> {
    /// A data push and its bytes
    Data(&'a [u8]),
    /// The next byte is not a push opcode
    NotPush(u8),
    /// A push declared more bytes than the script holds
    Truncated,
    /// No bytes left
    End,
}

/// Forward-only cursor over script bytes
#[derive(Debug, Clone)]
pub struct ScriptReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ScriptReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current offset into the script
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    /// Read `len` bytes, or nothing if fewer remain
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Read an unsigned little-endian integer of `width` bytes (at most 4)
    pub fn read_le(&mut self, width: usize) -> Option<usize> {
        debug_assert!(width <= 4);
        let raw = self.read_bytes(width)?;
        Some(
            raw.iter()
                .enumerate()
                .fold(0usize, |acc, (i, b)| acc | (usize::from(*b) << (8 * i))),
        )
    }

    /// Advance past the first occurrence of `opcode`
    ///
    /// Scans byte by byte, so an opcode-valued byte inside earlier push data
    /// also counts.
    pub fn seek_past(&mut self, opcode: u8) -> bool {
        match self.bytes[self.pos..].iter().position(|b| *b == opcode) {
            Some(offset) => {
                self.pos += offset + 1;
                true
            }
            None => {
                self.pos = self.bytes.len();
                false
            }
        }
    }

    /// Read one push instruction
    pub fn read_push(&mut self) -> Push<'a> {
        let Some(op) = self.read_u8() else {
            return Push::End;
        };

        let len = match op {
            1..=OP_PUSHBYTES_MAX => Some(usize::from(op)),
            OP_PUSHDATA1 => self.read_le(1),
            OP_PUSHDATA2 => self.read_le(2),
            OP_PUSHDATA4 => self.read_le(4),
            other => return Push::NotPush(other),
        };

        match len.and_then(|len| self.read_bytes(len)) {
            Some(data) => Push::Data(data),
            None => Push::Truncated,
        }
    }
}

/// Extract the bytes pushed after the first `marker_opcode` in a script
///
/// Consecutive pushes are concatenated until a non-push opcode or the end of
/// the script.
///
/// # Returns
/// `None` when the marker is absent, nothing was pushed, or a push length
/// runs past the end of the script
pub fn extract_payload_after_marker(script_hex: &str, marker_opcode: u8) -> Option<Vec<u8>> {
    let bytes = decode_script_hex(script_hex)?;
    let mut reader = ScriptReader::new(&bytes);

    if !reader.seek_past(marker_opcode) {
        return None;
    }

    let mut payload = Vec::new();
    loop {
        match reader.read_push() {
            Push::Data(data) => payload.extend_from_slice(data),
            Push::NotPush(_) | Push::End => break,
            Push::Truncated => return None,
        }
    }

    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Extract the `OP_RETURN` payload of an output script
pub fn extract_op_return(script_hex: &str) -> Option<Vec<u8>> {
    extract_payload_after_marker(script_hex, OP_RETURN)
}

/// Render bytes as printable ASCII, `.` for anything outside `0x20..=0x7e`
pub fn visible_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| if (0x20..=0x7e).contains(b) { char::from(*b) } else { '.' })
        .collect()
}

/// Render a hex string as printable ASCII for display
pub fn bytes_to_visible_ascii(hex_str: &str) -> String {
    decode_script_hex(hex_str)
        .map(|bytes| visible_ascii(&bytes))
        .unwrap_or_default()
}
