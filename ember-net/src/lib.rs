#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod net;

pub use net::handle::{Handle, HandleId, HandleTable};
pub use net::reactor::{ConnectionChange, ReadyFrame, Reactor};
pub use net::wire::{
    make_batch_trailer, make_error_reply, make_reply, parse_data_message, DataMessage, Field, FieldPresence,
    FieldType, Info1, Info2, Info3, MessageHeader, Op, OpType, ProtoHeader, ProtoType, DIGEST_SIZE,
    MESSAGE_HEADER_SIZE, PROTO_HEADER_SIZE,
};
