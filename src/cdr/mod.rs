//! Call Detail Records.
//!
//! Avaya PBXs emit one fixed-width ASCII line per completed call. This
//! module holds the decoded record, the line decoder and the spill file
//! for lines that fail to decode.

mod decoder;
mod spill;
mod types;

pub use decoder::{decode_line, CallZone, DecodeError, LineDecoder, END_TIME_FORMAT, LINE_LENGTH};
pub use spill::{FailedRecord, SpillError, SpillFile};
pub use types::Cdr;
