//! Reader-side EPC Gen2 (ISO 18000-63) protocol core for UHF RFID
//! transceivers with pluggable radio backends.
//!
//! The crate drives a narrowband UHF transceiver chip through the [`Radio`]
//! trait to singulate, identify and perform memory operations on passive
//! tags: Q-slotted anti-collision inventory with adaptive Q, Select-based
//! population filtering (including truncated replies), and the full access
//! command set (Access, Read, Write, BlockWrite, Lock, Kill) with
//! cover-coded payloads and delayed-reply handling.
//!
//! SPI transport, interrupt delivery and antenna tuning stay on the board
//! side: implement [`Radio`] and [`Clock`] for your transceiver glue and
//! hand them to [`Gen2Reader`].
//!
//! # Example
//!
//! ```ignore
//! use gen2_reader::{
//!     AdaptiveQ, Gen2Config, Gen2Reader, InventoryStatistics, SearchParams, TagCollector,
//! };
//!
//! let mut reader = Gen2Reader::new(radio, clock);
//! reader.open(Gen2Config::default());
//!
//! let mut stats = InventoryStatistics { q: 4, ..Default::default() };
//! let mut adaptive = AdaptiveQ::default();
//! let mut collector = TagCollector::default();
//! reader.search_for_tags(
//!     false,
//!     SearchParams {
//!         singulate: true,
//!         toggle_session: false,
//!         truncate: None,
//!         statistics: &mut stats,
//!         adaptive_q: &mut adaptive,
//!     },
//!     &mut collector,
//! );
//! for tag in &collector.tags {
//!     println!("tag {}", tag.epc_hex());
//! }
//! ```

pub mod bits;
pub mod crc;
pub mod radio;
pub mod timing;

mod reader;
mod types;

pub use flagset;

// Re-exports
pub use radio::{Clock, RESP_TX_IRQ, Radio, RadioError};
pub use reader::{Gen2Reader, SearchHandler, SearchParams, TagCollector};
pub use types::{
    AdaptiveQ, Coding, DivideRatio, Gen2Config, Gen2Error, InventoryStatistics, LinkFrequency,
    LockAction, LockPayload, LockTarget, MAX_EPC_LENGTH, MAX_PC_LENGTH, MAX_READ_DATA_LEN,
    MemoryBank, QFP_SCALE, QuerySel, QuerySession, QueryTarget, RssiMeasurement, SelectAction,
    SelectParams, SelectTarget, SlotEvent, Tag, TagError, Tari, TruncateToken, XPC_W1_XEB,
    adj_opt, stored_pc,
};
