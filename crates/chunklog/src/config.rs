use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;

/// Maximum ring capacity (1 GiB). The ring pointers are 31-bit modular
/// counters, so the capacity must leave one wrap of headroom.
const WRITE_BUFFER_MAX_SIZE: usize = 1024 * 1024 * 1024;

/// Smallest supported flash page (one disk sector).
const FLASH_PAGE_MIN_SIZE: usize = 512;

/// Default unit of aligned I/O.
const DEFAULT_FLASH_PAGE_SIZE: usize = 4 * 1024;

/// Default ring capacity.
const DEFAULT_WRITE_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Default secondary log segment size.
const DEFAULT_LOG_SEGMENT_SIZE: usize = 8 * 1024 * 1024;

/// Default per-range coalescing buffer size.
const DEFAULT_SECONDARY_LOG_BUFFER_SIZE: usize = 128 * 1024;

/// Default primary log file size.
const DEFAULT_PRIMARY_LOG_SIZE: u64 = 256 * 1024 * 1024;

/// Default backup range size; a secondary log holds twice this.
const DEFAULT_BACKUP_RANGE_SIZE: u64 = 256 * 1024 * 1024;

/// Default invalidation ratio that makes a segment worth compacting.
const DEFAULT_REORG_UTILISATION_THRESHOLD: f64 = 0.60;

/// Default processing-thread wakeup timeout in milliseconds.
const DEFAULT_PROCESS_TIMEOUT_MS: u64 = 100;

#[inline]
fn floor_power_of_two(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        1_usize << (usize::BITS - 1 - value.leading_zeros())
    }
}

/// Clamps a value to the given range and rounds to the nearest power of two.
#[inline]
fn clamp_power_of_two(value: usize, min: usize, max: usize) -> usize {
    let clamped = value.clamp(min, max);
    if clamped.is_power_of_two() {
        return clamped;
    }

    let lower = floor_power_of_two(clamped).max(min);
    let upper = (lower << 1).min(max).max(min);

    if clamped - lower <= upper.saturating_sub(clamped) {
        lower
    } else {
        upper
    }
}

/// 64-bit chunk identifier: creator node id in the high 16 bits, local id
/// in the low 48 bits. Immutable once allocated.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl ChunkId {
    /// Number of bits of the local id part.
    pub const LOCAL_ID_BITS: u32 = 48;

    /// Creates a chunk id from a raw u64 value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Combines a creator node id and a local id.
    #[inline]
    pub const fn from_parts(creator: u16, local_id: u64) -> Self {
        Self(((creator as u64) << Self::LOCAL_ID_BITS) | (local_id & 0xFFFF_FFFF_FFFF))
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the creator node id (high 16 bits).
    #[inline]
    pub const fn creator(self) -> u16 {
        (self.0 >> Self::LOCAL_ID_BITS) as u16
    }

    /// Returns the local id (low 48 bits).
    #[inline]
    pub const fn local_id(self) -> u64 {
        self.0 & 0xFFFF_FFFF_FFFF
    }
}

impl From<u64> for ChunkId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Identifies one backup range on one owner, and therefore one secondary
/// log. Both halves are u16; larger range ids are rejected at the network
/// boundary before a key is ever built.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RangeKey {
    pub owner: u16,
    pub range_id: u16,
}

impl RangeKey {
    #[inline]
    pub const fn new(owner: u16, range_id: u16) -> Self {
        Self { owner, range_id }
    }

    /// Packs the key into a u32 for hashing: `(owner << 16) | range_id`.
    #[inline]
    pub const fn packed(self) -> u32 {
        ((self.owner as u32) << 16) | self.range_id as u32
    }

    /// Rebuilds a key from its packed form.
    #[inline]
    pub const fn from_packed(packed: u32) -> Self {
        Self {
            owner: (packed >> 16) as u16,
            range_id: packed as u16,
        }
    }
}

impl Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}/{}", self.owner, self.range_id)
    }
}

/// Chunk version: an epoch (bumped when a log is reset) and a counter that
/// increases monotonically within the epoch.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    pub epoch: u16,
    pub version: u32,
}

impl Version {
    /// Marks a tombstone: the chunk was removed.
    pub const INVALID: Version = Version {
        epoch: 0,
        version: u32::MAX,
    };

    #[inline]
    pub const fn new(epoch: u16, version: u32) -> Self {
        Self { epoch, version }
    }

    /// Whether this version marks a removal.
    #[inline]
    pub const fn is_tombstone(self) -> bool {
        self.version == u32::MAX
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_tombstone() {
            write!(f, "tombstone")
        } else {
            write!(f, "{}.{}", self.epoch, self.version)
        }
    }
}

/// How log files hit the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Ordinary positioned file I/O through the page cache.
    Buffered,
    /// O_DIRECT-style unbuffered I/O; buffers and offsets are page-aligned.
    Direct,
    /// A raw block device managed as a slab of preallocated files.
    Raw,
}

impl Default for AccessMode {
    fn default() -> Self {
        Self::Buffered
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Buffered => write!(f, "buffered"),
            AccessMode::Direct => write!(f, "direct"),
            AccessMode::Raw => write!(f, "raw"),
        }
    }
}

/// Configuration surface for a [`LogStore`](crate::LogStore).
///
/// Sizes are normalized into power-of-two windows by [`LogConfig::normalized`];
/// call it after building a config from external input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory that holds the primary log, secondary logs and version
    /// snapshots (unused for the raw access mode).
    pub root_dir: PathBuf,

    /// Ring capacity in bytes. Power of two, between `flash_page_size`
    /// and 1 GiB.
    pub write_buffer_size: usize,

    /// Unit of aligned I/O. Power of two, at least one sector.
    pub flash_page_size: usize,

    /// Secondary log segment size. Power of two, at least one flash page.
    pub log_segment_size: usize,

    /// Per-range coalescing buffer size. Small batches are delayed until
    /// roughly this many bytes can be written in one access.
    pub secondary_log_buffer_size: usize,

    /// Size of the shared primary log file.
    pub primary_log_size: u64,

    /// Size of one backup range; a secondary log holds `2 x` this.
    pub backup_range_size: u64,

    /// Invalidation ratio above which a segment is worth compacting.
    /// Fraction in (0, 1).
    pub reorg_utilisation_threshold: f64,

    /// Whether to store a CRC32 of each payload in the entry header.
    pub use_checksum: bool,

    /// Whether to store a coarse timestamp in each entry header.
    pub use_timestamps: bool,

    /// How log files hit the disk.
    pub access_mode: AccessMode,

    /// Block device path; required when `access_mode` is `raw`.
    pub raw_device_path: Option<PathBuf>,

    /// Stage small batches in the shared primary log before they reach
    /// their secondary log.
    pub two_level_logging: bool,

    /// Processing-thread wakeup timeout in milliseconds.
    pub process_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/chunklog"),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            flash_page_size: DEFAULT_FLASH_PAGE_SIZE,
            log_segment_size: DEFAULT_LOG_SEGMENT_SIZE,
            secondary_log_buffer_size: DEFAULT_SECONDARY_LOG_BUFFER_SIZE,
            primary_log_size: DEFAULT_PRIMARY_LOG_SIZE,
            backup_range_size: DEFAULT_BACKUP_RANGE_SIZE,
            reorg_utilisation_threshold: DEFAULT_REORG_UTILISATION_THRESHOLD,
            use_checksum: false,
            use_timestamps: false,
            access_mode: AccessMode::default(),
            raw_device_path: None,
            two_level_logging: true,
            process_timeout_ms: DEFAULT_PROCESS_TIMEOUT_MS,
        }
    }
}

impl LogConfig {
    /// Returns a copy with all sizes rounded into their valid windows.
    ///
    /// - `flash_page_size` is a power of two, at least one sector.
    /// - `write_buffer_size` is a power of two in
    ///   `[flash_page_size, 1 GiB]`.
    /// - `log_segment_size` is a power of two, at least one flash page.
    /// - `secondary_log_buffer_size` is clamped to
    ///   `[flash_page_size, log_segment_size]`.
    /// - `backup_range_size` and `primary_log_size` are rounded up to a
    ///   whole number of segments (which keeps every log file a whole
    ///   number of flash pages).
    /// - `reorg_utilisation_threshold` outside `(0, 1)` falls back to the
    ///   default.
    pub fn normalized(mut self) -> Self {
        self.flash_page_size = clamp_power_of_two(
            self.flash_page_size.max(1),
            FLASH_PAGE_MIN_SIZE,
            DEFAULT_LOG_SEGMENT_SIZE,
        );

        self.write_buffer_size = clamp_power_of_two(
            self.write_buffer_size.max(1),
            self.flash_page_size,
            WRITE_BUFFER_MAX_SIZE,
        );

        self.log_segment_size = clamp_power_of_two(
            self.log_segment_size.max(1),
            self.flash_page_size,
            WRITE_BUFFER_MAX_SIZE,
        );

        self.secondary_log_buffer_size = self
            .secondary_log_buffer_size
            .clamp(self.flash_page_size, self.log_segment_size);

        let segment = self.log_segment_size as u64;
        let range = self.backup_range_size.max(segment);
        self.backup_range_size = range.div_ceil(segment) * segment;
        self.primary_log_size = self.primary_log_size.max(segment).div_ceil(segment) * segment;

        if !(self.reorg_utilisation_threshold > 0.0 && self.reorg_utilisation_threshold < 1.0) {
            self.reorg_utilisation_threshold = DEFAULT_REORG_UTILISATION_THRESHOLD;
        }

        if self.process_timeout_ms == 0 {
            self.process_timeout_ms = DEFAULT_PROCESS_TIMEOUT_MS;
        }

        self
    }

    /// Usable size of one secondary log file.
    #[inline]
    pub fn secondary_log_size(&self) -> u64 {
        2 * self.backup_range_size
    }

    /// Number of segments per secondary log.
    #[inline]
    pub fn segments_per_log(&self) -> usize {
        (self.secondary_log_size() / self.log_segment_size as u64) as usize
    }

    /// Largest single (sub-)entry, header included. Entries above this are
    /// split into chained parts.
    #[inline]
    pub fn max_entry_size(&self) -> usize {
        self.log_segment_size / 2
    }

    /// Ring fill level that triggers a flush without an explicit signal.
    #[inline]
    pub fn flush_threshold(&self) -> usize {
        (self.write_buffer_size as f64 * 0.45) as usize
    }
}

impl Display for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogConfig(root_dir={:?}, write_buffer_size={}, flash_page_size={}, log_segment_size={}, secondary_log_buffer_size={}, primary_log_size={}, backup_range_size={}, reorg_utilisation_threshold={}, use_checksum={}, use_timestamps={}, access_mode={}, two_level_logging={}, process_timeout_ms={})",
            self.root_dir,
            self.write_buffer_size,
            self.flash_page_size,
            self.log_segment_size,
            self.secondary_log_buffer_size,
            self.primary_log_size,
            self.backup_range_size,
            self.reorg_utilisation_threshold,
            self.use_checksum,
            self.use_timestamps,
            self.access_mode,
            self.two_level_logging,
            self.process_timeout_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_normal() {
        let cfg = LogConfig::default();
        let normalized = cfg.clone().normalized();
        assert_eq!(cfg, normalized);
        assert!(cfg.write_buffer_size.is_power_of_two());
        assert!(cfg.log_segment_size.is_power_of_two());
        assert_eq!(cfg.secondary_log_size() % cfg.log_segment_size as u64, 0);
    }

    #[test]
    fn normalized_clamps_sizes() {
        let cfg = LogConfig {
            write_buffer_size: 100_000,
            log_segment_size: 5000,
            secondary_log_buffer_size: 16,
            reorg_utilisation_threshold: 3.0,
            ..LogConfig::default()
        }
        .normalized();

        assert_eq!(cfg.write_buffer_size, 128 * 1024);
        assert_eq!(cfg.log_segment_size, 4096);
        assert_eq!(cfg.secondary_log_buffer_size, cfg.flash_page_size);
        assert_eq!(cfg.reorg_utilisation_threshold, 0.60);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = LogConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: LogConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn chunk_id_pack_unpack() {
        let cid = ChunkId::from_parts(0x0003, 0x2A);
        assert_eq!(cid.creator(), 0x0003);
        assert_eq!(cid.local_id(), 0x2A);
        assert_eq!(cid.as_u64(), 0x0003_0000_0000_002A);
    }

    #[test]
    fn range_key_pack_unpack() {
        let key = RangeKey::new(0xBEEF, 7);
        assert_eq!(key, RangeKey::from_packed(key.packed()));
        assert_eq!(key.packed(), 0xBEEF_0007);
    }

    #[test]
    fn version_ordering() {
        assert!(Version::new(0, 5) < Version::new(0, 6));
        assert!(Version::new(0, u32::MAX - 1) < Version::new(1, 0));
        assert!(Version::INVALID.is_tombstone());
    }
}
