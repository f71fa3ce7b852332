#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod status;
pub use status::{Status, StatusCode};

mod payload;
pub use payload::Payload;

mod codec;
pub use codec::{Encoding, SerializationContext};

pub mod msg;
pub use msg::{Metadata, MetadataValue};

pub mod sync;

pub mod transport;
pub use transport::{TransportFactory, TransportListener, TransportStream};

mod tcp;
pub use tcp::TcpTransport;

mod method;
pub use method::{CallShape, Method};

mod context;
pub use context::CallContext;

mod call;
pub use call::{CallParts, CallSummary, IncomingCall, RequestStream, ResponseStream, ServerCall};

mod router;
pub use router::Router;

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod state;
pub use state::State;

mod listener;
pub use listener::Listener;

mod server;
pub use server::{Server, ServerConfig};

mod client;
pub use client::{CallOptions, Client, ClientConfig, RequestSender, ResponseReceiver};
