//! Tag numbers and value kinds used by rpm headers.

// ── Region tags ────────────────────────────────────────────────────

pub const TAG_HEADER_IMAGE: i32 = 61;
pub const TAG_HEADER_SIGNATURES: i32 = 62;
pub const TAG_HEADER_IMMUTABLE: i32 = 63;

/// Lowest tag number allowed in a region-carrying header.
pub const TAG_HEADER_I18N_TABLE: i32 = 100;

// ── Package tags ───────────────────────────────────────────────────

/// Signature-header tag merged into database headers at load time.
pub const TAG_SIG_PGP: i32 = 259;

pub const TAG_NAME: i32 = 1000;
pub const TAG_VERSION: i32 = 1001;
pub const TAG_RELEASE: i32 = 1002;
pub const TAG_EPOCH: i32 = 1003;
pub const TAG_ARCH: i32 = 1022;
/// Full-path filename array stored by pre-dirname-compression packages.
pub const TAG_OLD_FILENAMES: i32 = 1027;
pub const TAG_SOURCE_RPM: i32 = 1044;
pub const TAG_DIR_INDEXES: i32 = 1116;
pub const TAG_BASENAMES: i32 = 1117;
pub const TAG_DIR_NAMES: i32 = 1118;
pub const TAG_PAYLOAD_DIGEST: i32 = 5092;
pub const TAG_PAYLOAD_DIGEST_ALGO: i32 = 5093;
pub const TAG_MODULARITY_LABEL: i32 = 5096;

/// Whether `tag` opens a region envelope.
pub fn is_region_tag(tag: i32) -> bool {
    matches!(
        tag,
        TAG_HEADER_IMAGE | TAG_HEADER_SIGNATURES | TAG_HEADER_IMMUTABLE
    )
}

// ── Value kinds ────────────────────────────────────────────────────

/// On-disk value kind of a header entry (stored as u32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Kind {
    Null = 0,
    Char = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    String = 6,
    Bin = 7,
    StringArray = 8,
    I18nString = 9,
}

impl Kind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Null),
            1 => Some(Self::Char),
            2 => Some(Self::Int8),
            3 => Some(Self::Int16),
            4 => Some(Self::Int32),
            5 => Some(Self::Int64),
            6 => Some(Self::String),
            7 => Some(Self::Bin),
            8 => Some(Self::StringArray),
            9 => Some(Self::I18nString),
            _ => None,
        }
    }

    /// Natural alignment of the kind's elements inside the data arena.
    pub fn alignment(&self) -> u64 {
        match self {
            Kind::Int16 => 2,
            Kind::Int32 => 4,
            Kind::Int64 => 8,
            _ => 1,
        }
    }

    /// Fixed element size in bytes, or `None` for NUL-terminated kinds.
    pub fn element_size(&self) -> Option<u64> {
        match self {
            Kind::Null => Some(0),
            Kind::Char | Kind::Int8 | Kind::Bin => Some(1),
            Kind::Int16 => Some(2),
            Kind::Int32 => Some(4),
            Kind::Int64 => Some(8),
            Kind::String | Kind::StringArray | Kind::I18nString => None,
        }
    }

    /// The three string kinds are interchangeable in historical databases.
    pub fn is_string_class(&self) -> bool {
        matches!(self, Kind::String | Kind::StringArray | Kind::I18nString)
    }
}
