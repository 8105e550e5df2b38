//! Session wire protocol: typed messages, the binary codec, and the
//! outbound sequence counter.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_frame, encode_frame, CodecError, Frame};
pub use messages::SessionMessage;
pub use sequence::SequenceCounter;
