//! A reliability and framing engine for RTPS over UDP.
//!
//! Received datagrams are framed into sub-messages by a buffer-recycling receive strategy,
//!  fragmented samples are reassembled, and the sub-messages are dispatched to reliable readers
//!  and writers. Their protocol state machines produce outbound sub-messages, which are
//!  deduplicated and bundled into as few datagrams as possible.
//!
//! [link::RtpsUdpLink] is the entry point that ties these parts together.

pub mod config;
pub mod disjoint_sequence;
pub mod link;
pub mod receive;
pub mod reliability;
pub mod send;
pub mod util;
pub mod wire;
