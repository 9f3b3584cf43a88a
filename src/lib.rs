//! Client-side runtime for the Language Server Protocol.
//!
//! A long-lived, bidirectional JSON-RPC 2.0 messenger framed by
//! `Content-Length` headers, layered the same way top to bottom:
//!
//! - **Framing**: `Content-Length` codec over raw byte streams
//! - **Server**: how the server process is reached (child process or pipes)
//! - **Protocol**: JSON-RPC 2.0 envelopes and message classification
//! - **Dispatch**: method-name registry for server-initiated traffic
//! - **Connection**: send/receive/dispatch loops and correlation tables
//! - **Client**: lifecycle orchestration (`initialize` through `exit`)

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod framing;
pub mod logging;
pub mod protocol;
pub mod server;

pub use client::{ClientError, ClientState, LanguageClient, ServerSpec};
pub use connection::{Connection, ConnectionError, ConnectionState};
pub use dispatch::{Dispatcher, Handler, HandlerError, HandlerRegistration, RegistryError};
pub use framing::{FrameReader, FrameWriter, FramingError};
pub use protocol::{JsonRpcErrorCode, JsonRpcErrorObject, RequestId};
pub use server::{
    AdapterError, ChildProcessServer, ExitLatch, PipeServer, ServerAdapter, ServerExit,
    ServerStreams,
};
