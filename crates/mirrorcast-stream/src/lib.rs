//! Video data socket, frame demuxing, and elementary stream parsing.
//!
//! This crate realizes the data channel to the device (listening or
//! connecting depending on the tunnel mode), strips the companion's
//! stream preamble and frame headers, and splits the raw Annex B
//! elementary stream into classified coded units.

mod demux;
mod error;
mod parser;
mod socket;

pub use demux::{DemuxEvent, FrameDemuxer, VideoPacket};
pub use error::StreamError;
pub use parser::{
    CodedUnit, CodedUnitKind, ElementaryStreamParser, ParameterSetBundle, ParameterSetKind,
    ParserOutput,
};
pub use socket::{SocketEvent, VideoSocket};

/// Channel capacity for raw socket data chunks.
pub const DATA_CHANNEL_CAPACITY: usize = 32;

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
