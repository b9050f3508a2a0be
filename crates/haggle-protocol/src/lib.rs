//! Shared types for talking to the Haggle daemon.
//!
//! Everything in here is plain data: attributes, data objects, neighbor
//! nodes, the events the daemon pushes, and the JSON-RPC envelope used on
//! the daemon socket. Both the client library and the mock daemon build on
//! these definitions so the two ends cannot drift apart.

mod attribute;
mod data_object;
mod event;
mod lifecycle;
mod node;
mod protocol;

pub use attribute::{Attribute, AttributeError, DEFAULT_WEIGHT};
pub use data_object::{DataObject, DataObjectId, DataObjectIdError, Payload};
pub use event::{is_event_message, Event, EventKind};
pub use lifecycle::{
    default_pid_path, default_socket_path, read_pid_file, remove_pid_file, remove_socket,
    write_pid_file,
};
pub use node::{Node, NodeInterface};
pub use protocol::{
    codes, methods, Registration, Request, RequestId, Response, RpcError,
};
