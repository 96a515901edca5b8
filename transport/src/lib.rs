//! runq-transport - the C2 framed duplex channel and the C5 vsock job
//! protocol types.

pub mod channel;
pub mod job;
