/// Hand-rolled decoding of the two kernel trace record shapes we care about.
///
/// There is no schema decoder here: field positions come from the provider's
/// record layout.  All reads go through [`Cursor`], which refuses to step past
/// the end of the record, so truncated or malformed records decode to `None`.
use std::fmt;

/// 128-bit provider identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub u128);

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

/// Header fields of a delivered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub provider: Guid,
    pub id: u16,
    pub version: u8,
    pub opcode: u8,
    pub task: u16,
    /// Process that caused the record.
    pub process_id: u32,
}

impl RecordHeader {
    pub fn is(&self, shape: Shape) -> bool {
        self.opcode == shape.opcode && self.task == shape.task && self.id == shape.id
    }
}

/// Opcode/task/id triple identifying a record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub opcode: u8,
    pub task: u16,
    pub id: u16,
}

pub const PROCESS_START: Shape = Shape { opcode: 1, task: 1, id: 1 };
pub const REGISTRY_QUERY_VALUE: Shape = Shape { opcode: 38, task: 0, id: 7 };

/// Start of the user SID field in a process-start record, by minimum record
/// version.  Checked top-down; the first entry whose version is <= the
/// record's version wins.
const SID_OFFSETS: [(u8, usize); 3] = [(4, 48), (3, 44), (0, 28)];
/// Alignment pad in front of the SID.
const SID_PAD: usize = 4;
/// Revision, sub-authority count and 6-byte identifier authority.
const SID_FIXED_LEN: usize = 8;
const SID_MAX_SUB_AUTHORITIES: usize = 15;
/// Id of the started process; the payload opens with it, followed by the
/// 64-bit process sequence number.
const PROCESS_ID_OFFSET: usize = 0;
const SEQUENCE_NUMBER_OFFSET: usize = 4;
/// Fixed prefix in front of the value name in a registry query record.
const REGISTRY_VALUE_NAME_OFFSET: usize = 20;

pub fn sid_offset(version: u8) -> usize {
    SID_OFFSETS
        .iter()
        .find(|(min, _)| version >= *min)
        .map(|(_, offset)| *offset)
        .unwrap_or(SID_OFFSETS[SID_OFFSETS.len() - 1].1)
}

/// Bounds-checked reader over a record's user data.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Positions a cursor at `pos`, or `None` if that lies past the end.
    pub fn at(data: &'a [u8], pos: usize) -> Option<Self> {
        (pos <= data.len()).then_some(Self { data, pos })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        self.pos = end;
        Some(())
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        bytes.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    /// Reads a NUL-terminated UTF-16LE string.  A string that runs off the end
    /// of the record is rejected.
    pub fn read_utf16z(&mut self) -> Option<String> {
        let mut units = Vec::with_capacity(self.remaining() / 2);
        loop {
            match self.read_u16()? {
                0 => break,
                unit => units.push(unit),
            }
        }
        Some(String::from_utf16_lossy(&units))
    }
}

/// Decoded process-start record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStart {
    pub process_id: u32,
    pub image_path: String,
}

impl ProcessStart {
    pub fn file_name(&self) -> &str {
        file_name(&self.image_path)
    }
}

pub fn decode_process_start(version: u8, data: &[u8]) -> Option<ProcessStart> {
    let process_id = Cursor::at(data, PROCESS_ID_OFFSET)?.read_u32()?;

    let mut cursor = Cursor::at(data, sid_offset(version))?;
    cursor.skip(SID_PAD)?;
    let sid_start = cursor.position();
    cursor.skip(1)?; // revision
    let sub_authorities = usize::from(cursor.read_u8()?);
    if sub_authorities > SID_MAX_SUB_AUTHORITIES {
        return None;
    }

    let mut cursor = Cursor::at(data, sid_start + SID_FIXED_LEN + 4 * sub_authorities)?;
    let image_path = cursor.read_utf16z()?;
    if image_path.is_empty() {
        return None;
    }
    Some(ProcessStart {
        process_id,
        image_path,
    })
}

pub fn decode_registry_value_name(data: &[u8]) -> Option<String> {
    let name = Cursor::at(data, REGISTRY_VALUE_NAME_OFFSET)?.read_utf16z()?;
    (!name.is_empty()).then_some(name)
}

/// Returns the text after the last path separator.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    // ── offsets ───────────────────────────────────────────────────────────────

    #[test]
    fn sid_offset_follows_version_table() {
        assert_eq!(sid_offset(0), 28);
        assert_eq!(sid_offset(2), 28);
        assert_eq!(sid_offset(3), 44);
        assert_eq!(sid_offset(4), 48);
        assert_eq!(sid_offset(9), 48);
    }

    // ── cursor ────────────────────────────────────────────────────────────────

    #[test]
    fn cursor_refuses_to_read_past_end() {
        let data = [1u8, 0, 0];
        let mut c = Cursor::at(&data, 0).unwrap();
        assert_eq!(c.read_u16(), Some(1));
        assert_eq!(c.read_u16(), None);
        assert_eq!(c.position(), 2);
        assert!(c.skip(2).is_none());
        assert!(Cursor::at(&data, 4).is_none());
        assert!(c.skip(usize::MAX).is_none());
    }

    #[test]
    fn utf16z_without_terminator_is_rejected() {
        let mut data = utf16z("abc");
        data.truncate(data.len() - 2);
        assert_eq!(Cursor::at(&data, 0).unwrap().read_utf16z(), None);
    }

    // ── process start ─────────────────────────────────────────────────────────

    #[test]
    fn decodes_process_start_for_every_version_band() {
        for version in [0, 2, 3, 4, 5] {
            let data = process_start(version, 4242, 5, r"\Device\HarddiskVolume3\Windows\explorer.exe");
            let start = decode_process_start(version, &data).unwrap();
            assert_eq!(start.process_id, 4242);
            assert_eq!(start.file_name(), "explorer.exe");
        }
    }

    #[test]
    fn process_id_is_read_ahead_of_the_sequence_number() {
        let mut data = process_start(4, 5120, 1, r"C:\Windows\explorer.exe");
        data[SEQUENCE_NUMBER_OFFSET..SEQUENCE_NUMBER_OFFSET + 8]
            .copy_from_slice(&0x1_0000_00A3u64.to_le_bytes());
        assert_eq!(u32::from_le_bytes(data[0..4].try_into().unwrap()), 5120);
        assert_eq!(decode_process_start(4, &data).unwrap().process_id, 5120);
    }

    #[test]
    fn sid_length_depends_on_sub_authority_count() {
        for subs in [0u8, 1, 4, 15] {
            let data = process_start(4, 7, subs, r"C:\Apps\XboxPcApp.exe");
            assert_eq!(decode_process_start(4, &data).unwrap().file_name(), "XboxPcApp.exe");
        }
    }

    #[test]
    fn wrong_version_misreads_instead_of_panicking() {
        let data = process_start(4, 7, 1, r"C:\x.exe");
        let decoded = decode_process_start(0, &data);
        assert_ne!(decoded.map(|d| d.image_path), Some(r"C:\x.exe".to_string()));
    }

    #[test]
    fn every_truncation_of_a_process_record_decodes_to_none() {
        let data = process_start(3, 99, 5, r"C:\Windows\explorer.exe");
        for len in 0..data.len() {
            assert_eq!(decode_process_start(3, &data[..len]), None, "len {len}");
        }
    }

    #[test]
    fn absurd_sub_authority_count_is_rejected() {
        let mut data = process_start(4, 1, 1, r"C:\a.exe");
        data[sid_offset(4) + SID_PAD + 1] = 200;
        assert_eq!(decode_process_start(4, &data), None);
    }

    #[test]
    fn empty_image_path_is_no_match() {
        let data = process_start(4, 1, 1, "");
        assert_eq!(decode_process_start(4, &data), None);
    }

    // ── registry ──────────────────────────────────────────────────────────────

    #[test]
    fn decodes_registry_value_name_after_fixed_prefix() {
        assert_eq!(
            decode_registry_value_name(&registry_query("AltTabSettings")).as_deref(),
            Some("AltTabSettings")
        );
    }

    #[test]
    fn short_registry_records_decode_to_none() {
        let data = registry_query("AltTabSettings");
        for len in 0..data.len() {
            assert_eq!(decode_registry_value_name(&data[..len]), None, "len {len}");
        }
        assert_eq!(decode_registry_value_name(&registry_query("")), None);
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    #[test]
    fn file_name_takes_last_component() {
        assert_eq!(file_name(r"C:\Windows\explorer.exe"), "explorer.exe");
        assert_eq!(file_name("/usr/bin/env"), "env");
        assert_eq!(file_name("bare.exe"), "bare.exe");
        assert_eq!(file_name(r"C:\dir\"), "");
    }

    #[test]
    fn guid_debug_uses_registry_format() {
        let g = Guid(0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716);
        assert_eq!(format!("{g:?}"), "{22FB2CD6-0E7B-422B-A0C7-2FAD1FD0E716}");
    }
}
