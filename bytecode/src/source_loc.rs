//! Delta-encoded VLQ source-location table: maps bytecode offsets to
//! source line/column ranges.
//!
//! Each entry is 5 VLQ values:
//! - `delta_pc` (unsigned VLQ)
//! - `delta_line0`, `delta_char0`, `delta_line1`, `delta_char1`
//!   (signed, zigzag + VLQ)
//!
//! An entry covers every offset from its `pc` up to the next entry's `pc`.

/// A source range, lines and columns both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub line0: u32,
    pub char0: u32,
    pub line1: u32,
    pub char1: u32,
}

impl SourceLoc {
    pub const fn new(line0: u32, char0: u32, line1: u32, char1: u32) -> Self {
        Self {
            line0,
            char0,
            line1,
            char1,
        }
    }

    /// A location spanning a single line.
    pub const fn line(line: u32) -> Self {
        Self::new(line, 1, line, 1)
    }
}

/// Accumulates source locations while bytecode is emitted.
///
/// Consecutive records with an identical location collapse into one
/// entry.
pub struct SourceLocTableBuilder {
    entries: Vec<(u32, SourceLoc)>,
}

impl SourceLocTableBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Record that bytecode starting at `pc` came from `loc`.
    pub fn add(&mut self, pc: u32, loc: SourceLoc) {
        if let Some((last_pc, last_loc)) = self.entries.last_mut() {
            if *last_loc == loc {
                return;
            }
            if *last_pc == pc {
                *last_loc = loc;
                return;
            }
        }
        self.entries.push((pc, loc));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Produce the delta-encoded VLQ byte stream.
    pub fn finish(self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut prev_pc: u32 = 0;
        let mut prev = [0i64; 4];

        for (pc, loc) in &self.entries {
            encode_unsigned_vlq(pc - prev_pc, &mut buf);
            let cur = [
                loc.line0 as i64,
                loc.char0 as i64,
                loc.line1 as i64,
                loc.char1 as i64,
            ];
            for (c, p) in cur.iter().zip(prev.iter()) {
                encode_unsigned_vlq(zigzag_encode(c - p), &mut buf);
            }
            prev_pc = *pc;
            prev = cur;
        }

        buf
    }
}

impl Default for SourceLocTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterate the `(pc, loc)` entries of an encoded table.
///
/// Returns `None` if the table is malformed.
pub fn source_loc_entries(encoded: &[u8]) -> Option<Vec<(u32, SourceLoc)>> {
    let mut pos = 0;
    let mut pc: u32 = 0;
    let mut cur = [0i64; 4];
    let mut out = Vec::new();

    while pos < encoded.len() {
        pc = pc.checked_add(decode_unsigned_vlq(encoded, &mut pos)?)?;
        for field in cur.iter_mut() {
            *field += zigzag_decode(decode_unsigned_vlq(encoded, &mut pos)?);
        }
        out.push((
            pc,
            SourceLoc::new(cur[0] as u32, cur[1] as u32, cur[2] as u32, cur[3] as u32),
        ));
    }

    Some(out)
}

/// Look up the location covering `target_pc`: the last entry with
/// `pc <= target_pc`.
pub fn source_loc_lookup(encoded: &[u8], target_pc: u32) -> Option<SourceLoc> {
    let mut pos = 0;
    let mut pc: u32 = 0;
    let mut cur = [0i64; 4];
    let mut best = None;

    while pos < encoded.len() {
        pc = pc.checked_add(decode_unsigned_vlq(encoded, &mut pos)?)?;
        for field in cur.iter_mut() {
            *field += zigzag_decode(decode_unsigned_vlq(encoded, &mut pos)?);
        }
        if pc > target_pc {
            break;
        }
        best = Some(SourceLoc::new(
            cur[0] as u32,
            cur[1] as u32,
            cur[2] as u32,
            cur[3] as u32,
        ));
    }

    best
}

// ── VLQ helpers ─────────────────────────────────────────────────────

/// Encode an unsigned integer as a variable-length quantity.
/// Each byte uses 7 data bits + 1 continuation bit (MSB).
pub fn encode_unsigned_vlq(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode an unsigned VLQ from `encoded` starting at `pos`.
/// Advances `pos` past the consumed bytes.
pub fn decode_unsigned_vlq(encoded: &[u8], pos: &mut usize) -> Option<u32> {
    let mut result: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *encoded.get(*pos)?;
        *pos += 1;
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift >= 35 {
            return None;
        }
    }
}

fn zigzag_encode(value: i64) -> u32 {
    ((value << 1) ^ (value >> 63)) as u32
}

fn zigzag_decode(value: u32) -> i64 {
    ((value >> 1) as i64) ^ (-((value & 1) as i64))
}
