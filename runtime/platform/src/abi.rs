//! Kernel ABI constants and enumerations
//!
//! Everything in this module crosses the user/kernel boundary as plain words,
//! so each enumeration carries an explicit `#[repr(usize)]` encoding and a
//! fallible decoder.

use bitflags::bitflags;
use static_assertions::const_assert;

/// Machine word
pub type Word = usize;

/// Number of significant bits in a capability address
pub const CPTR_BITS: u8 = 32;

/// Base page size (4 KiB)
pub const BASE_PAGE_SIZE: usize = 4096;

/// Bits of a base page
pub const BASE_PAGE_BITS: usize = 12;

/// Bytes covered by one first-level (L1) entry: 1 MiB
pub const L1_SECTION_SIZE: usize = 1 << 20;

/// Entries in a first-level translation table
pub const L1_ENTRIES: usize = 4096;

/// Entries in a second-level descriptor
pub const L2_ENTRIES: usize = 1024;

/// Mask applied to `vaddr >> 12` to obtain the second-level index
pub const L2_INDEX_MASK: usize = 0x3FF;

/// Capability slots in one CNode
pub const CNODE_SLOTS: u32 = 4096;

/// Maximum argument words carried by one invocation
pub const MAX_INVOKE_ARGS: usize = 9;

/// Maximum payload words carried by one LMP message
pub const LMP_MSG_WORDS: usize = 9;

/// Default receive buffer of a freshly retyped endpoint, in words
pub const DEFAULT_ENDPOINT_BUF_WORDS: usize = 128;

/// Object sizes used when retyping from RAM
pub const OBJSIZE_L1: usize = 16 * 1024;
pub const OBJSIZE_L2: usize = L2_ENTRIES * 4;
pub const OBJSIZE_DISPATCHER: usize = BASE_PAGE_SIZE;
pub const OBJSIZE_CNODE: usize = CNODE_SLOTS as usize * 16;

const_assert!(MAX_INVOKE_ARGS == 9);
const_assert!(LMP_MSG_WORDS == 9);
const_assert!(L1_ENTRIES == 1 << 12);
const_assert!(L2_ENTRIES * BASE_PAGE_SIZE == 4 * L1_SECTION_SIZE);
const_assert!(OBJSIZE_L2 % BASE_PAGE_SIZE == 0);
const_assert!(DEFAULT_ENDPOINT_BUF_WORDS >= LMP_MSG_WORDS + 1);

/// Identifier of a CNode object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CNodeId(pub u32);

/// Location of a capability: a CNode and a slot inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapAddr {
    pub cnode: CNodeId,
    pub slot: u32,
}

impl CapAddr {
    /// The null capability address
    pub const NULL: CapAddr = CapAddr {
        cnode: CNodeId(0),
        slot: 0,
    };

    pub const fn new(cnode: CNodeId, slot: u32) -> Self {
        Self { cnode, slot }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

/// Well-known slots in the root CNode of every domain
pub mod slots {
    /// The domain's own dispatcher
    pub const DISPATCHER: u32 = 1;
    /// The domain's root CNode
    pub const ROOT_CNODE: u32 = 2;
    /// The domain's first-level translation table
    pub const L1_TABLE: u32 = 3;
    /// Endpoint of the domain's channel to init
    pub const INIT_EP: u32 = 4;
    /// Kernel capability (init only)
    pub const KERNEL: u32 = 5;
    /// Boot RAM region (init only)
    pub const BOOT_RAM: u32 = 6;
    /// Device memory region (init only)
    pub const DEVICE_RAM: u32 = 7;
    /// IRQ table (init only)
    pub const IRQ_TABLE: u32 = 8;
    /// First slot handed out by slot allocators
    pub const FIRST_FREE: u32 = 16;
}

const_assert!(slots::FIRST_FREE > slots::IRQ_TABLE);

/// Kernel object types
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjType {
    Null = 0,
    Ram = 1,
    Frame = 2,
    DevFrame = 3,
    CNode = 4,
    L1Table = 5,
    L2Table = 6,
    Dispatcher = 7,
    Endpoint = 8,
    Kernel = 9,
    IrqTable = 10,
}

impl ObjType {
    pub fn from_word(word: Word) -> Option<Self> {
        Some(match word {
            0 => Self::Null,
            1 => Self::Ram,
            2 => Self::Frame,
            3 => Self::DevFrame,
            4 => Self::CNode,
            5 => Self::L1Table,
            6 => Self::L2Table,
            7 => Self::Dispatcher,
            8 => Self::Endpoint,
            9 => Self::Kernel,
            10 => Self::IrqTable,
            _ => return None,
        })
    }

    /// Whether a capability of this type can be mapped into a table
    pub fn is_mappable(&self) -> bool {
        matches!(self, Self::Frame | Self::DevFrame | Self::L2Table)
    }

    /// Minimum object size when retyped from RAM, `None` for types the
    /// kernel never produces by retype from RAM
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::L1Table => Some(OBJSIZE_L1),
            Self::L2Table => Some(OBJSIZE_L2),
            Self::Dispatcher => Some(OBJSIZE_DISPATCHER),
            Self::CNode => Some(OBJSIZE_CNODE),
            _ => None,
        }
    }
}

/// Capability invocation opcodes
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Retype = 1,
    Create = 2,
    Copy = 3,
    Mint = 4,
    Delete = 5,
    Revoke = 6,
    Map = 7,
    Unmap = 8,
    Identify = 9,
    ModifyFlags = 10,
    DispatcherSetup = 11,
    DispatcherStop = 12,
    IrqTableSet = 13,
    IrqTableDelete = 14,
    GetCoreId = 15,
}

impl Opcode {
    pub fn from_word(word: Word) -> Option<Self> {
        Some(match word {
            1 => Self::Retype,
            2 => Self::Create,
            3 => Self::Copy,
            4 => Self::Mint,
            5 => Self::Delete,
            6 => Self::Revoke,
            7 => Self::Map,
            8 => Self::Unmap,
            9 => Self::Identify,
            10 => Self::ModifyFlags,
            11 => Self::DispatcherSetup,
            12 => Self::DispatcherStop,
            13 => Self::IrqTableSet,
            14 => Self::IrqTableDelete,
            15 => Self::GetCoreId,
            _ => return None,
        })
    }
}

/// Errors reported by the kernel in the result word of a trap
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    InvalidArgument = 1,
    InvalidCapability = 2,
    TypeMismatch = 3,
    SlotInUse = 4,
    RangeError = 5,
    AlignmentError = 6,
    Overlap = 7,
    AlreadyMapped = 8,
    NotMapped = 9,
    BufferFull = 10,
    NoReceiveSlot = 11,
    IllegalOperation = 12,
    Timeout = 13,
    DispatcherStopped = 14,
    InsufficientRights = 15,
    NotEnoughMemory = 16,
}

impl KernelError {
    /// Decode a non-zero result word. Unknown codes map to `IllegalOperation`.
    pub fn from_word(word: Word) -> Self {
        match word {
            1 => Self::InvalidArgument,
            2 => Self::InvalidCapability,
            3 => Self::TypeMismatch,
            4 => Self::SlotInUse,
            5 => Self::RangeError,
            6 => Self::AlignmentError,
            7 => Self::Overlap,
            8 => Self::AlreadyMapped,
            9 => Self::NotMapped,
            10 => Self::BufferFull,
            11 => Self::NoReceiveSlot,
            13 => Self::Timeout,
            14 => Self::DispatcherStopped,
            15 => Self::InsufficientRights,
            16 => Self::NotEnoughMemory,
            _ => Self::IllegalOperation,
        }
    }

    pub fn as_word(self) -> Word {
        self as Word
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::InvalidCapability => "invalid capability",
            Self::TypeMismatch => "object type mismatch",
            Self::SlotInUse => "destination slot in use",
            Self::RangeError => "range error",
            Self::AlignmentError => "alignment error",
            Self::Overlap => "region overlaps an existing object",
            Self::AlreadyMapped => "already mapped",
            Self::NotMapped => "not mapped",
            Self::BufferFull => "endpoint buffer full",
            Self::NoReceiveSlot => "no receive slot supplied",
            Self::IllegalOperation => "illegal operation",
            Self::Timeout => "timed out",
            Self::DispatcherStopped => "dispatcher stopped",
            Self::InsufficientRights => "insufficient rights",
            Self::NotEnoughMemory => "not enough memory",
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for KernelError {}

bitflags! {
    /// Access rights carried by a capability
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapRights: Word {
        const READ = 0x01;
        const WRITE = 0x02;
        const GRANT = 0x04;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::GRANT.bits();
    }
}

bitflags! {
    /// Attributes of a virtual mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: Word {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        const NOCACHE = 0x08;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objtype_words() {
        for ty in [ObjType::Ram, ObjType::Frame, ObjType::Endpoint, ObjType::IrqTable] {
            assert_eq!(ObjType::from_word(ty as Word), Some(ty));
        }
        assert_eq!(ObjType::from_word(99), None);
    }

    #[test]
    fn test_unknown_kernel_error_is_illegal_operation() {
        assert_eq!(KernelError::from_word(0xFFFF), KernelError::IllegalOperation);
        assert_eq!(KernelError::from_word(10), KernelError::BufferFull);
    }

    #[test]
    fn test_null_capaddr() {
        assert!(CapAddr::NULL.is_null());
        assert!(!CapAddr::new(CNodeId(1), 0).is_null());
    }

    #[test]
    fn test_mappable_types() {
        assert!(ObjType::Frame.is_mappable());
        assert!(ObjType::L2Table.is_mappable());
        assert!(!ObjType::Endpoint.is_mappable());
    }
}
