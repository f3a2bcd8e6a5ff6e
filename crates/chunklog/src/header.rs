//! Log entry header codec.
//!
//! The first byte of every entry fully determines the header size: flag
//! bits select which optional fields are present and two bits select the
//! width of the payload length field. A zero first byte is never a valid
//! entry; it terminates a segment or batch.
//!
//! Two flavours share the format. *Primary* headers carry a routing prefix
//! (`range_id`, `owner`) so the processing thread can sort ring contents
//! by backup range; *secondary* headers are the same bytes with the prefix
//! stripped, which is all a per-range log needs. Conversion is a byte-level
//! rewrite, not a re-encode.
//!
//! All multi-byte fields are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::buf::PooledBuf;
use crate::config::{ChunkId, Version};
use crate::error::{LogError, LogResult};

/// Marks the end of a segment or batch on disk.
pub const TERMINATOR: u8 = 0;

/// Upper bound of any header, every optional field included.
pub const MAX_HEADER_SIZE: usize = 32;

/// Large entries split into at most this many chained parts.
pub const MAX_CHAIN_COUNT: u8 = 127;

/// Set on every live header; a zero type byte is a terminator.
const TYPE_ENTRY: u8 = 0x01;
/// Routing prefix (`range_id: u16`, `owner: u16`) present.
const TYPE_PRIMARY: u8 = 0x02;
/// `original_owner: u16` present (only when it differs from the owner).
const TYPE_MIGRATED: u8 = 0x04;
/// `timestamp: u32` present.
const TYPE_TIMESTAMP: u8 = 0x08;
/// `crc32: u32` over the payload present.
const TYPE_CHECKSUM: u8 = 0x10;
/// `chain_id: u8`, `chain_count: u8` present.
const TYPE_CHAINED: u8 = 0x20;
/// Bits 6..8 store the payload length field width minus one (1..=3 bytes).
const LEN_SEL_SHIFT: u32 = 6;

const LOCAL_ID_BYTES: usize = 6;

/// Byte offsets of every field of a header, derived from the type byte.
#[derive(Debug, Clone, Copy)]
pub struct HeaderLayout {
    pub size: usize,
    routing: Option<usize>,
    original_owner: Option<usize>,
    local_id: usize,
    length: usize,
    pub len_width: usize,
    version: usize,
    chain: Option<usize>,
    timestamp: Option<usize>,
    checksum: Option<usize>,
}

impl HeaderLayout {
    pub fn of(type_byte: u8) -> LogResult<Self> {
        if type_byte & TYPE_ENTRY == 0 {
            return Err(LogError::corruption(format!(
                "invalid log entry type byte 0x{type_byte:02X}"
            )));
        }
        let len_width = ((type_byte >> LEN_SEL_SHIFT) & 0x3) as usize + 1;
        if len_width > 3 {
            return Err(LogError::corruption(format!(
                "invalid length width in type byte 0x{type_byte:02X}"
            )));
        }

        let mut at = 1;
        let routing = (type_byte & TYPE_PRIMARY != 0).then(|| {
            let off = at;
            at += 4;
            off
        });
        let original_owner = (type_byte & TYPE_MIGRATED != 0).then(|| {
            let off = at;
            at += 2;
            off
        });
        let local_id = at;
        at += LOCAL_ID_BYTES;
        let length = at;
        at += len_width;
        let version = at;
        at += 6;
        let chain = (type_byte & TYPE_CHAINED != 0).then(|| {
            let off = at;
            at += 2;
            off
        });
        let timestamp = (type_byte & TYPE_TIMESTAMP != 0).then(|| {
            let off = at;
            at += 4;
            off
        });
        let checksum = (type_byte & TYPE_CHECKSUM != 0).then(|| {
            let off = at;
            at += 4;
            off
        });

        Ok(Self {
            size: at,
            routing,
            original_owner,
            local_id,
            length,
            len_width,
            version,
            chain,
            timestamp,
            checksum,
        })
    }
}

/// True iff the full header fits into `bytes_available` contiguous bytes.
#[inline]
pub fn is_readable(type_byte: u8, bytes_available: usize) -> bool {
    HeaderLayout::of(type_byte)
        .map(|layout| layout.size <= bytes_available)
        .unwrap_or(false)
}

/// Header size derived from the type byte alone.
#[inline]
pub fn header_size(type_byte: u8) -> LogResult<usize> {
    HeaderLayout::of(type_byte).map(|layout| layout.size)
}

/// Decoded view of one entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub type_byte: u8,
    /// `(range_id, owner)`; primary flavour only.
    pub routing: Option<(u16, u16)>,
    /// Present only when the creator differs from the owner.
    pub original_owner: Option<u16>,
    pub local_id: u64,
    pub length: u32,
    pub version: Version,
    /// `(chain_id, chain_count)` for split entries.
    pub chain: Option<(u8, u8)>,
    pub timestamp: Option<u32>,
    pub checksum: Option<u32>,
}

impl EntryHeader {
    /// Header size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        // Layout derivation cannot fail for a decoded header.
        HeaderLayout::of(self.type_byte).map(|l| l.size).unwrap_or(0)
    }

    /// Total entry size, payload included.
    #[inline]
    pub fn entry_size(&self) -> usize {
        self.size() + self.length as usize
    }

    pub fn is_primary(&self) -> bool {
        self.type_byte & TYPE_PRIMARY != 0
    }

    /// Rebuilds the chunk id from the local id and the owning node.
    pub fn chunk_id(&self, range_owner: u16) -> ChunkId {
        let creator = self.original_owner.unwrap_or(range_owner);
        ChunkId::from_parts(creator, self.local_id)
    }
}

/// Decodes a header from `buf`, which must hold at least the full header.
pub fn decode(buf: &[u8]) -> LogResult<EntryHeader> {
    if buf.is_empty() {
        return Err(LogError::corruption("empty log entry header"));
    }
    let type_byte = buf[0];
    let layout = HeaderLayout::of(type_byte)?;
    if buf.len() < layout.size {
        return Err(LogError::corruption(format!(
            "truncated log entry header: need {} bytes, have {}",
            layout.size,
            buf.len()
        )));
    }

    let routing = layout.routing.map(|off| {
        (
            LittleEndian::read_u16(&buf[off..]),
            LittleEndian::read_u16(&buf[off + 2..]),
        )
    });
    let original_owner = layout
        .original_owner
        .map(|off| LittleEndian::read_u16(&buf[off..]));
    let local_id = LittleEndian::read_uint(&buf[layout.local_id..], LOCAL_ID_BYTES);
    let length = LittleEndian::read_uint(&buf[layout.length..], layout.len_width) as u32;
    let version = Version::new(
        LittleEndian::read_u16(&buf[layout.version..]),
        LittleEndian::read_u32(&buf[layout.version + 2..]),
    );
    let chain = layout.chain.map(|off| (buf[off], buf[off + 1]));
    let timestamp = layout
        .timestamp
        .map(|off| LittleEndian::read_u32(&buf[off..]));
    let checksum = layout
        .checksum
        .map(|off| LittleEndian::read_u32(&buf[off..]));

    Ok(EntryHeader {
        type_byte,
        routing,
        original_owner,
        local_id,
        length,
        version,
        chain,
        timestamp,
        checksum,
    })
}

/// Inputs for building a primary header.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryHeaderSpec {
    pub chunk_id: ChunkId,
    /// Payload length of the (largest) part; selects the length width.
    pub payload_len: u32,
    pub version: Version,
    pub range_id: u16,
    pub owner: u16,
    pub original_owner: u16,
    pub timestamp: Option<u32>,
    pub with_checksum: bool,
    pub chained: bool,
}

#[inline]
fn length_width(len: u32) -> usize {
    if len <= 0xFF {
        1
    } else if len <= 0xFFFF {
        2
    } else {
        3
    }
}

/// Builds a primary header; returns the bytes and the header size.
pub fn encode_primary(spec: &PrimaryHeaderSpec) -> ([u8; MAX_HEADER_SIZE], usize) {
    let mut type_byte = TYPE_ENTRY | TYPE_PRIMARY;
    if spec.original_owner != spec.owner {
        type_byte |= TYPE_MIGRATED;
    }
    if spec.timestamp.is_some() {
        type_byte |= TYPE_TIMESTAMP;
    }
    if spec.with_checksum {
        type_byte |= TYPE_CHECKSUM;
    }
    if spec.chained {
        type_byte |= TYPE_CHAINED;
    }
    let len_width = length_width(spec.payload_len);
    type_byte |= ((len_width - 1) as u8) << LEN_SEL_SHIFT;

    let layout = HeaderLayout::of(type_byte).expect("constructed type byte is valid");
    let mut bytes = [0u8; MAX_HEADER_SIZE];
    bytes[0] = type_byte;

    let routing = layout.routing.expect("primary header has routing");
    LittleEndian::write_u16(&mut bytes[routing..], spec.range_id);
    LittleEndian::write_u16(&mut bytes[routing + 2..], spec.owner);
    if let Some(off) = layout.original_owner {
        LittleEndian::write_u16(&mut bytes[off..], spec.original_owner);
    }
    LittleEndian::write_uint(
        &mut bytes[layout.local_id..],
        spec.chunk_id.local_id(),
        LOCAL_ID_BYTES,
    );
    LittleEndian::write_uint(&mut bytes[layout.length..], spec.payload_len as u64, len_width);
    LittleEndian::write_u16(&mut bytes[layout.version..], spec.version.epoch);
    LittleEndian::write_u32(&mut bytes[layout.version + 2..], spec.version.version);
    if let Some(ts) = spec.timestamp {
        let off = layout.timestamp.expect("timestamp flag set");
        LittleEndian::write_u32(&mut bytes[off..], ts);
    }
    // Chain and checksum slots are patched per part.

    (bytes, layout.size)
}

/// Sets the chaining pair of a chained header.
pub fn set_chaining(header: &mut [u8], chain_id: u8, chain_count: u8) {
    let layout = HeaderLayout::of(header[0]).expect("valid header");
    let off = layout.chain.expect("header is chained");
    header[off] = chain_id;
    header[off + 1] = chain_count;
}

/// Overwrites the payload length of one part. The new length must fit the
/// width selected at encode time.
pub fn adjust_length(header: &mut [u8], new_len: u32) {
    let layout = HeaderLayout::of(header[0]).expect("valid header");
    debug_assert!(length_width(new_len) <= layout.len_width);
    LittleEndian::write_uint(&mut header[layout.length..], new_len as u64, layout.len_width);
}

/// Stores the payload CRC in the header's checksum slot.
pub fn set_checksum(header: &mut [u8], crc: u32) {
    let layout = HeaderLayout::of(header[0]).expect("valid header");
    let off = layout.checksum.expect("checksum flag set");
    LittleEndian::write_u32(&mut header[off..], crc);
}

/// CRC32 over a payload.
#[inline]
pub fn payload_crc(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Number of leading bytes replaced when a primary header becomes a
/// secondary header: the type byte plus the 4-byte routing prefix.
#[inline]
pub fn conversion_offset(type_byte: u8) -> usize {
    if type_byte & TYPE_PRIMARY != 0 { 5 } else { 1 }
}

/// Size delta of one entry under primary-to-secondary conversion.
#[inline]
pub fn conversion_shrink(type_byte: u8) -> usize {
    conversion_offset(type_byte) - 1
}

/// Copies `len` logical bytes starting at ring position `offset` into `dst`,
/// following the wrap-around.
pub fn ring_copy(ring: &[u8], offset: usize, len: usize, dst: &mut PooledBuf) {
    let capacity = ring.len();
    let offset = offset % capacity;
    let first = len.min(capacity - offset);
    dst.put(&ring[offset..offset + first]);
    if first < len {
        dst.put(&ring[..len - first]);
    }
}

/// Reads `len` logical bytes starting at ring position `offset` into `out`.
pub fn ring_read(ring: &[u8], offset: usize, out: &mut [u8]) {
    let capacity = ring.len();
    let offset = offset % capacity;
    let len = out.len();
    let first = len.min(capacity - offset);
    out[..first].copy_from_slice(&ring[offset..offset + first]);
    if first < len {
        out[first..].copy_from_slice(&ring[..len - first]);
    }
}

/// Rewrites one primary entry as secondary format while copying it out of
/// the ring into `dst`. `entry_size` is the primary size (header plus
/// payload); the secondary rendition is `conversion_shrink` bytes smaller.
/// Returns the converted size.
pub fn convert_and_put(
    ring: &[u8],
    offset: usize,
    entry_size: usize,
    dst: &mut PooledBuf,
) -> LogResult<usize> {
    let mut type_byte = [0u8; 1];
    ring_read(ring, offset, &mut type_byte);
    let type_byte = type_byte[0];
    let skip = conversion_offset(type_byte);
    let converted = entry_size - (skip - 1);
    debug_assert!(converted <= dst.remaining());

    dst.put(&[type_byte & !TYPE_PRIMARY]);
    let capacity = ring.len();
    ring_copy(ring, (offset + skip) % capacity, entry_size - skip, dst);
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;

    fn spec() -> PrimaryHeaderSpec {
        PrimaryHeaderSpec {
            chunk_id: ChunkId::from_parts(0x0002, 0x1234),
            payload_len: 100,
            version: Version::new(1, 7),
            range_id: 3,
            owner: 0x0002,
            original_owner: 0x0002,
            timestamp: None,
            with_checksum: false,
            chained: false,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let (bytes, size) = encode_primary(&spec());
        let header = decode(&bytes[..size]).expect("decode");
        assert_eq!(header.size(), size);
        assert_eq!(header.routing, Some((3, 0x0002)));
        assert_eq!(header.original_owner, None);
        assert_eq!(header.local_id, 0x1234);
        assert_eq!(header.length, 100);
        assert_eq!(header.version, Version::new(1, 7));
        assert_eq!(header.chain, None);
    }

    #[test]
    fn every_flag_combination_round_trips() {
        for migrated in [false, true] {
            for ts in [None, Some(42u32)] {
                for crc in [false, true] {
                    for chained in [false, true] {
                        for len in [1u32, 300, 70_000] {
                            let mut s = spec();
                            s.payload_len = len;
                            s.original_owner = if migrated { 0x0009 } else { s.owner };
                            s.timestamp = ts;
                            s.with_checksum = crc;
                            s.chained = chained;
                            let (mut bytes, size) = encode_primary(&s);
                            if chained {
                                set_chaining(&mut bytes[..size], 2, 5);
                            }
                            if crc {
                                set_checksum(&mut bytes[..size], 0xDEAD_BEEF);
                            }
                            let header = decode(&bytes[..size]).expect("decode");
                            assert_eq!(header.length, len);
                            assert_eq!(header.timestamp, ts);
                            assert_eq!(
                                header.original_owner,
                                migrated.then_some(0x0009)
                            );
                            assert_eq!(header.chain, chained.then_some((2, 5)));
                            assert_eq!(header.checksum, crc.then_some(0xDEAD_BEEF));
                            assert_eq!(size, header_size(bytes[0]).expect("size"));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn migrated_flag_saves_two_bytes_when_equal() {
        let plain = encode_primary(&spec()).1;
        let mut migrated = spec();
        migrated.original_owner = 0x0007;
        assert_eq!(encode_primary(&migrated).1, plain + 2);
    }

    #[test]
    fn adjust_length_rewrites_in_place() {
        let mut s = spec();
        s.payload_len = 70_000;
        let (mut bytes, size) = encode_primary(&s);
        adjust_length(&mut bytes[..size], 123);
        assert_eq!(decode(&bytes[..size]).expect("decode").length, 123);
    }

    #[test]
    fn conversion_drops_routing_prefix() {
        let (bytes, size) = encode_primary(&spec());
        let ring = bytes[..size].to_vec();
        let pool = BufferPool::new(8192, 4096);
        let mut dst = pool.get(size).expect("buf");

        let converted = convert_and_put(&ring, 0, size, &mut dst).expect("convert");
        assert_eq!(converted, size - 4);

        let header = decode(dst.filled()).expect("decode secondary");
        assert!(!header.is_primary());
        assert_eq!(header.routing, None);
        assert_eq!(header.local_id, 0x1234);
        assert_eq!(header.length, 100);
        assert_eq!(header.chunk_id(0x0002), ChunkId::from_parts(0x0002, 0x1234));
    }

    #[test]
    fn terminator_is_never_readable() {
        assert!(!is_readable(TERMINATOR, usize::MAX));
        assert!(header_size(TERMINATOR).is_err());
    }

    #[test]
    fn ring_copy_follows_wrap() {
        let mut ring = vec![0u8; 16];
        for (i, b) in ring.iter_mut().enumerate() {
            *b = i as u8;
        }
        let pool = BufferPool::new(8192, 4096);
        let mut dst = pool.get(8).expect("buf");
        ring_copy(&ring, 12, 8, &mut dst);
        assert_eq!(dst.filled(), &[12, 13, 14, 15, 0, 1, 2, 3]);
    }
}
