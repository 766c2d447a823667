//! Wire format for the weft messaging substrate.
//!
//! Two layers live here:
//!
//! - [`message`]: the logical envelope (`topic`, `syncToken`, `isResponse`,
//!   `payload`) serialized as compact JSON. `origin` is a local annotation
//!   stamped by the receiving side from peer identity and never travels on
//!   the wire.
//! - [`framing`]: length-prefixed framing that delimits envelopes within a
//!   continuous byte stream. A `u32` big-endian length prefix replaces
//!   delimiter-based framing so payloads can carry arbitrary bytes without
//!   an escaping layer.

pub mod framing;
pub mod message;

pub use framing::{FrameDecoder, FrameReader, FramingError, MAX_FRAME_SIZE};
pub use message::{
    Message, ProtocolError, TOPIC_FAILURE, TOPIC_RESOLUTION, TOPIC_RESOLVE, TOPIC_SUCCESS,
};
