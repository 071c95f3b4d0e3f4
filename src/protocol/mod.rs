//! Wire protocol shared by workers and the coordinator.
//!
//! One TCP connection carries a stream of JSON objects in both directions:
//!
//! 1. The worker sends its [`WorkerIdentity`] as soon as it accepts.
//! 2. The coordinator sends a [`JobRequest`], the worker answers with exactly
//!    one [`JobResult`], and the pair repeats until either side closes.
//!
//! There is no length prefix and no reliance on newlines; [`JsonCodec`]
//! finds object boundaries by parsing.

pub mod codec;
pub mod types;

pub use codec::{
    frame_reader, frame_writer, read_frame, retarget_reader, write_frame, FrameReader,
    FrameWriter, JsonCodec, ProtocolError, MAX_FRAME_LEN,
};
pub use types::{JobRequest, JobResult, WorkerIdentity, PROTOCOL_VERSION, WORKER_ID_PREFIX};
