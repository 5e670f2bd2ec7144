//! Wire protocol spoken between domains and init
//!
//! Word 0 of every message is a [`MessageType`] tag. A reply carries the
//! request's tag with [`REPLY_BIT`] set and a [`Status`] in word 1.
//!
//! | Request | Arguments | Reply |
//! |---|---|---|
//! | `INIT_CONNECT` | + endpoint cap | `ACK` |
//! | `PING` | value | status, value |
//! | `GET_RAM_CAP` | size bits | status, size bits + RAM cap |
//! | `GET_DEVICE_CAP` | paddr, bytes | status + device frame cap |
//! | `SERIAL_PUTCHAR` | char | none |
//! | `SERIAL_PUTSTR` | len, packed chars | none |
//! | `SERIAL_GETCHAR` | domain id | status, char |
//! | `LED_SET` | on | status |
//! | `REGISTER_SERVICE` | service id (+ endpoint cap) | status (+ router endpoint cap) |
//! | `FIND_SERVICE` | service id | status (+ endpoint cap) |
//! | `REQUEST_EP` | correlation | (answered with `DELIVER_EP`) |
//! | `DELIVER_EP` | status, correlation (+ endpoint cap) | none |
//! | `SPAWN_DOMAIN` | core, len, packed name | status, pid |
//! | `GET_PROCESS_NAME` | pid | status, len, packed name |
//! | `GET_ALL_PIDS` | offset | status, total, count, pids |
//! | `KILL_DOMAIN` | pid | status |
//! | `OPEN_FILE` | len, packed path | status, fd |
//! | `READ_FILE` | fd, position, bytes | status, count, packed bytes |
//! | `CLOSE_FILE` | fd | status |

use tern_platform::Word;

/// Set in the tag word of every reply
pub const REPLY_BIT: Word = 1 << 16;

/// Message type tags
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    InitConnect = 1,
    Ack = 2,
    Ping = 3,
    GetRamCap = 4,
    SerialPutchar = 5,
    SerialPutstr = 6,
    SerialGetchar = 7,
    LedSet = 8,
    GetDeviceCap = 9,
    RegisterService = 10,
    FindService = 11,
    RequestEp = 12,
    DeliverEp = 13,
    SpawnDomain = 14,
    GetProcessName = 15,
    GetAllPids = 16,
    KillDomain = 17,
    OpenFile = 18,
    ReadFile = 19,
    CloseFile = 20,
}

impl MessageType {
    pub fn from_word(word: Word) -> Option<Self> {
        Some(match word & !REPLY_BIT {
            1 => Self::InitConnect,
            2 => Self::Ack,
            3 => Self::Ping,
            4 => Self::GetRamCap,
            5 => Self::SerialPutchar,
            6 => Self::SerialPutstr,
            7 => Self::SerialGetchar,
            8 => Self::LedSet,
            9 => Self::GetDeviceCap,
            10 => Self::RegisterService,
            11 => Self::FindService,
            12 => Self::RequestEp,
            13 => Self::DeliverEp,
            14 => Self::SpawnDomain,
            15 => Self::GetProcessName,
            16 => Self::GetAllPids,
            17 => Self::KillDomain,
            18 => Self::OpenFile,
            19 => Self::ReadFile,
            20 => Self::CloseFile,
            _ => return None,
        })
    }

    pub fn tag(self) -> Word {
        self as Word
    }

    pub fn reply_tag(self) -> Word {
        self as Word | REPLY_BIT
    }
}

/// Status word carried by replies
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    AlreadyRegistered = 2,
    OutOfMemory = 3,
    InvalidArgument = 4,
    InvalidMessage = 5,
    Timeout = 6,
    Unsupported = 7,
    Busy = 8,
    Failed = 9,
}

impl Status {
    /// Unknown codes decode as `Failed`
    pub fn from_word(word: Word) -> Self {
        match word {
            0 => Self::Ok,
            1 => Self::NotFound,
            2 => Self::AlreadyRegistered,
            3 => Self::OutOfMemory,
            4 => Self::InvalidArgument,
            5 => Self::InvalidMessage,
            6 => Self::Timeout,
            7 => Self::Unsupported,
            8 => Self::Busy,
            _ => Self::Failed,
        }
    }

    pub fn as_word(self) -> Word {
        self as Word
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Kind of service a provider offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub Word);

impl ServiceId {
    pub const RAM: ServiceId = ServiceId(1);
    pub const SERIAL: ServiceId = ServiceId(2);
    pub const LED: ServiceId = ServiceId(3);
    pub const INIT: ServiceId = ServiceId(4);
    pub const DOMAIN_MANAGER: ServiceId = ServiceId(5);
    pub const FILESYSTEM: ServiceId = ServiceId(6);
    pub const TEST: ServiceId = ServiceId(7);

    /// Service ids are small integers below this bound
    pub const LIMIT: Word = 32;

    pub fn is_valid(self) -> bool {
        self.0 > 0 && self.0 < Self::LIMIT
    }
}

/// Token matching a `DELIVER_EP` to the `FIND_SERVICE` it answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub Word);

/// Domain identifier; 0 is init
pub type DomainId = usize;
