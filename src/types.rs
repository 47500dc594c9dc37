//! Types for the Gen2 protocol core.

use flagset::flags;
use thiserror::Error;

use crate::radio::RadioError;

/// Longest EPC identifier carried in a tag reply, in bytes.
pub const MAX_EPC_LENGTH: usize = 62;

/// Longest PC + XPC prefix (2-byte PC plus up to two XPC words), in bytes.
pub const MAX_PC_LENGTH: usize = 6;

/// Largest payload a single Read / BlockWrite moves, in bytes.
pub const MAX_READ_DATA_LEN: usize = 64;

/// StoredPC bit masks, applying to the first PC byte.
pub mod stored_pc {
    /// EPC length in 16-bit words (upper five bits).
    pub const L: u8 = 0xF8;
    /// User-memory indicator.
    pub const UMI: u8 = 0x04;
    /// XPC indicator: an XPC word follows the PC.
    pub const XI: u8 = 0x02;
    /// Toggle: EPC bank holds a non-EPC identifier.
    pub const T: u8 = 0x01;
}

/// XPC_W1 byte-0 extension bit: a second XPC word follows.
pub const XPC_W1_XEB: u8 = 0x80;

/// A singulated tag, valid until the next slot reuses the record.
#[derive(Debug, Clone)]
pub struct Tag {
    /// Protocol-Control word as backscattered.
    pub pc: [u8; 2],
    /// Extended PC words, `xpc_len` bytes valid.
    pub xpc: [u8; 4],
    pub xpc_len: u8,
    /// EPC identifier, `epc_len` bytes valid.
    pub epc: [u8; MAX_EPC_LENGTH],
    pub epc_len: u8,
    /// Session handle from Req_RN; required for memory access.
    pub handle: [u8; 2],
    /// RN16 from the Query reply.
    pub rn16: [u8; 2],
    pub agc: u8,
    pub rssi_log_i: u8,
    pub rssi_log_q: u8,
    pub rssi_lin_i: i8,
    pub rssi_lin_q: i8,
    /// Monotonic tick when the slot began.
    pub time_stamp: u32,
}

impl Tag {
    /// The valid EPC bytes.
    pub fn epc(&self) -> &[u8] {
        &self.epc[..usize::from(self.epc_len)]
    }

    /// The valid XPC bytes (empty when the tag sent no XPC).
    pub fn xpc(&self) -> &[u8] {
        &self.xpc[..usize::from(self.xpc_len)]
    }

    /// EPC as an uppercase hex string.
    pub fn epc_hex(&self) -> String {
        bytes_to_hex(self.epc())
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self {
            pc: [0; 2],
            xpc: [0; 4],
            xpc_len: 0,
            epc: [0; MAX_EPC_LENGTH],
            epc_len: 0,
            handle: [0; 2],
            rn16: [0; 2],
            agc: 0,
            rssi_log_i: 0,
            rssi_log_q: 0,
            rssi_lin_i: 0,
            rssi_lin_q: 0,
            time_stamp: 0,
        }
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.epc() == other.epc()
    }
}

/// Memory bank selection for tag operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryBank {
    /// Reserved memory bank (kill and access passwords)
    Reserved = 0x00,
    /// EPC memory bank
    Epc = 0x01,
    /// TID memory bank
    Tid = 0x02,
    /// User memory bank
    User = 0x03,
}

/// Backscatter link frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFrequency {
    Khz640,
    Khz320,
    Khz256,
    /// 213.3 kHz
    Khz213,
    Khz160,
    Khz40,
}

/// Reader-to-tag reference interval (duration of a data-0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tari {
    /// 6.25 us
    Us6_25 = 0x00,
    /// 12.5 us
    Us12_5 = 0x01,
    /// 25 us
    Us25 = 0x02,
}

/// Tag-to-reader line coding (the M field of Query).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Coding {
    Fm0 = 0x00,
    Miller2 = 0x01,
    Miller4 = 0x02,
    Miller8 = 0x03,
}

/// Divide ratio announced in Query (TRcal divisor for the tag's BLF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivideRatio {
    /// DR = 8
    Dr8,
    /// DR = 64/3
    Dr64By3,
}

impl DivideRatio {
    /// The DR bit as transmitted in Query.
    pub fn bit(self) -> u8 {
        match self {
            DivideRatio::Dr8 => 0,
            DivideRatio::Dr64By3 => 1,
        }
    }
}

/// Sel field of Query: which tags respond
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QuerySel {
    /// All tags respond
    #[default]
    All0 = 0x00,
    /// All tags respond (alternate encoding)
    All1 = 0x01,
    /// Only tags with SL deasserted respond
    NotSl = 0x02,
    /// Only tags with SL asserted respond
    Sl = 0x03,
}

/// Session for Query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QuerySession {
    #[default]
    S0 = 0x00,
    S1 = 0x01,
    S2 = 0x02,
    S3 = 0x03,
}

/// Inventoried-flag target for Query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QueryTarget {
    #[default]
    A = 0x00,
    B = 0x01,
}

/// Immutable per-round link and population configuration.
#[derive(Debug, Clone)]
pub struct Gen2Config {
    pub blf: LinkFrequency,
    pub tari: Tari,
    pub coding: Coding,
    /// Pilot-tone extension. Forced on for FM0 and Miller-2.
    pub trext: bool,
    pub sel: QuerySel,
    pub session: QuerySession,
    pub target: QueryTarget,
    /// Minimum spacing after Select/QueryAdjust in microseconds;
    /// 0 selects the tari-derived default.
    pub t4_min_us: u16,
}

impl Default for Gen2Config {
    fn default() -> Self {
        Self {
            blf: LinkFrequency::Khz256,
            tari: Tari::Us25,
            coding: Coding::Miller4,
            trext: true,
            sel: QuerySel::All0,
            session: QuerySession::S0,
            target: QueryTarget::A,
            t4_min_us: 0,
        }
    }
}

/// Target flag for Select (per EPC Gen2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SelectTarget {
    /// Inventoried S0
    #[default]
    S0 = 0x00,
    /// Inventoried S1
    S1 = 0x01,
    /// Inventoried S2
    S2 = 0x02,
    /// Inventoried S3
    S3 = 0x03,
    /// SL flag
    Sl = 0x04,
}

/// Action for Select (per EPC Gen2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SelectAction {
    /// Match: assert SL or inventoried→A, Non-match: deassert SL or inventoried→B
    #[default]
    Action0 = 0x00,
    /// Match: assert SL or inventoried→A, Non-match: do nothing
    Action1 = 0x01,
    /// Match: do nothing, Non-match: deassert SL or inventoried→B
    Action2 = 0x02,
    /// Match: negate SL or invert, Non-match: do nothing
    Action3 = 0x03,
    /// Match: deassert SL or inventoried→B, Non-match: assert SL or inventoried→A
    Action4 = 0x04,
    /// Match: deassert SL or inventoried→B, Non-match: do nothing
    Action5 = 0x05,
    /// Match: do nothing, Non-match: assert SL or inventoried→A
    Action6 = 0x06,
    /// Match: do nothing, Non-match: negate SL or invert
    Action7 = 0x07,
}

/// Parameters for the Select command
#[derive(Debug, Clone)]
pub struct SelectParams {
    /// Target session/flag
    pub target: SelectTarget,
    /// Action to perform
    pub action: SelectAction,
    /// Memory bank to match against
    pub mem_bank: MemoryBank,
    /// Bit pointer (starting bit position in memory bank), EBV-encoded
    pub pointer: u32,
    /// Mask data to match, MSB first
    pub mask: Vec<u8>,
    /// Mask length in bits
    pub mask_bits: u16,
    /// Whether to request truncated replies
    pub truncate: bool,
}

/// Proof that a Select with truncation armed the population for truncated
/// replies. Consumed by the next inventory round; dropping it unused simply
/// means the next round parses full replies again.
#[derive(Debug)]
pub struct TruncateToken(pub(crate) ());

/// Lock action for tag memory operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockAction {
    /// Unlock (read/write accessible without password)
    Unlock = 0x00,
    /// Lock (password required for read/write)
    Lock = 0x01,
    /// Permanent unlock (cannot be locked)
    PermUnlock = 0x02,
    /// Permanent lock (password always required, cannot be unlocked)
    PermLock = 0x03,
}

/// Lock target for specifying which memory area to lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockTarget {
    /// User memory bank
    User = 0x01,
    /// TID memory bank
    Tid = 0x02,
    /// EPC memory bank
    Epc = 0x03,
    /// Access password
    AccessPassword = 0x04,
    /// Kill password
    KillPassword = 0x05,
}

/// Lock mask and action payload
#[derive(Debug, Clone)]
pub struct LockPayload {
    /// Which memory area to apply the lock action to
    pub target: LockTarget,
    /// The lock action to perform
    pub action: LockAction,
}

impl LockPayload {
    /// Encode to the 20-bit Lock payload.
    ///
    /// Mask (10 bits) then action (10 bits); two bits per memory area in the
    /// order kill pwd, access pwd, EPC, TID, user. Mask bits select the areas
    /// the action applies to; action bits are `permalock | lock`.
    pub fn to_bits(&self) -> u32 {
        let shift = match self.target {
            LockTarget::User => 0,
            LockTarget::Tid => 2,
            LockTarget::Epc => 4,
            LockTarget::AccessPassword => 6,
            LockTarget::KillPassword => 8,
        };

        let mask: u32 = 0x03 << shift;
        let action: u32 = u32::from(self.action as u8) << shift;

        (mask << 10) | action
    }
}

flags! {
    /// Per-slot events reported to the search handler.
    pub enum SlotEvent: u16 {
        Collision = 0x0001,
        EmptySlot = 0x0002,
        TagFound = 0x0004,
        QueryRep = 0x0008,
        PreambleErr = 0x0010,
        CrcErr = 0x0020,
        HeaderErr = 0x0040,
        RxCountErr = 0x0080,
        /// The ACK had to be repeated before the EPC came back clean.
        ResendAck = 0x0100,
        /// The follow-tag command failed; the tag was dropped from the round.
        SkipFollowCmd = 0x0200,
    }
}

/// Running counters for one or more inventory rounds. Caller-owned so Q and
/// the statistics survive across rounds.
#[derive(Debug, Clone, Default)]
pub struct InventoryStatistics {
    /// Current anti-collision parameter; a round has `2^Q` slots.
    pub q: u8,
    pub tag_cnt: u32,
    pub empty_slot_cnt: u32,
    pub collision_cnt: u32,
    /// Tags dropped because the follow-tag command failed.
    pub skip_cnt: u32,
    pub preamble_err_cnt: u32,
    pub crc_err_cnt: u32,
    pub header_err_cnt: u32,
    pub rx_count_err_cnt: u32,
    /// Running mean of `rssi_log_i + rssi_log_q`, range 0-15.
    pub rssi_log_mean: u8,
}

/// Fixed-point scale of the adaptive-Q accumulator: one Q step is
/// `QFP_SCALE`.
pub const QFP_SCALE: u32 = 100_000;

/// Option bits for [`AdaptiveQ::options`].
pub mod adj_opt {
    /// Restore Q and the accumulator to their start-of-round values at
    /// teardown.
    pub const RESET_Q_AFTER_ROUND: u8 = 0x80;
    /// Round the accumulator with ceil on empty slots and floor on
    /// collisions instead of nearest.
    pub const USE_CEIL_FLOOR: u8 = 0x40;
    /// Allow at most one Q adjustment per round.
    pub const SINGLE_ADJUST: u8 = 0x20;
    /// Send QueryAdjust with unchanged Q instead of QueryRep after a
    /// non-tag slot.
    pub const USE_QUERY_ADJUST_NIC: u8 = 0x10;
}

/// Adaptive-Q controller state, ×10⁵ integer fixed point.
#[derive(Debug, Clone)]
pub struct AdaptiveQ {
    pub enabled: bool,
    /// Lower Q bound, in Q units.
    pub min_q: u8,
    /// Upper Q bound, in Q units.
    pub max_q: u8,
    /// Floating Q accumulator, scaled by [`QFP_SCALE`].
    pub qfp: u32,
    /// Per-Q empty-slot decrement, percent of one Q step.
    pub c1: [u8; 16],
    /// Per-Q collision increment, percent of one Q step.
    pub c2: [u8; 16],
    /// See [`adj_opt`].
    pub options: u8,
}

impl Default for AdaptiveQ {
    fn default() -> Self {
        Self {
            enabled: false,
            min_q: 0,
            max_q: 15,
            qfp: 0,
            c1: [0; 16],
            c2: [0; 16],
            options: 0,
        }
    }
}

/// Signal metrics sampled during a probe Query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RssiMeasurement {
    pub agc: u8,
    pub rssi_log_i: u8,
    pub rssi_log_q: u8,
    pub rssi_lin_i: i8,
    pub rssi_lin_q: i8,
}

/// Error codes a tag reports in a delayed reply with the error header bit
/// set (Gen2v2 Annex I). Codes outside the table collapse to `NonSpecific`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagError {
    Other = 0x00,
    NotSupported = 0x01,
    InsufficientPrivileges = 0x02,
    MemOverrun = 0x03,
    MemLocked = 0x04,
    Crypto = 0x05,
    Encapsulation = 0x06,
    ResponseBufferOverflow = 0x07,
    SecurityTimeout = 0x08,
    PowerShortage = 0x0B,
    NonSpecific = 0x0F,
}

impl TagError {
    /// Translate a raw Annex-I code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => TagError::Other,
            0x01 => TagError::NotSupported,
            0x02 => TagError::InsufficientPrivileges,
            0x03 => TagError::MemOverrun,
            0x04 => TagError::MemLocked,
            0x05 => TagError::Crypto,
            0x06 => TagError::Encapsulation,
            0x07 => TagError::ResponseBufferOverflow,
            0x08 => TagError::SecurityTimeout,
            0x0B => TagError::PowerShortage,
            _ => TagError::NonSpecific,
        }
    }

    /// The Annex-I code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Errors from protocol operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Gen2Error {
    /// The radio link failed; the inner error is the receive status.
    #[error("radio link: {0}")]
    Link(#[from] RadioError),
    /// The tag did not hand out a fresh RN16.
    #[error("Req_RN produced no fresh RN16")]
    ReqRn,
    /// The tag did not echo its handle during the Access sequence.
    #[error("tag failed to echo handle during access")]
    Access,
    /// A parameter was out of range for the operation.
    #[error("invalid parameter")]
    Param,
    /// The tag itself reported an error in a delayed reply.
    #[error("tag error: {0:?}")]
    Tag(TagError),
}

/// Convert bytes to uppercase hex string
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
