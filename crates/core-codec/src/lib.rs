//! LhyMicro-GL byte dialect.
//!
//! Everything in this crate is a pure function over bytes: distance tokens,
//! the packet CRC, status-word decoding, the speedcode formatter and the
//! direction-code permutation. No I/O, no state beyond immutable tables.

mod codes;
mod crc;
mod distance;
mod speed;
mod status;

pub use codes::CodeSet;
pub use crc::onewire_crc_lookup;
pub use distance::lhymicro_distance;
pub use speed::{Board, SpeedProfile, UnknownBoard};
pub use status::{
    STATUS_BAD_STATE, STATUS_BUSY, STATUS_FINISH, STATUS_OK, STATUS_PACKET_REJECTED, STATUS_POWER,
    describe_status,
};
