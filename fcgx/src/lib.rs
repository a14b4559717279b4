//! FastCGI client for HTTP front-ends.
//!
//! An incoming HTTP request becomes a sequence of framed FastCGI records on
//! a TCP or Unix-domain stream; the upstream's multiplexed stdout/stderr
//! streams come back through a [`pipe::ResponsePipe`], get their CGI header
//! block parsed, and replay onto an HTTP response. Clients can be built
//! directly, through the factories in [`client`], or taken from a
//! TTL-bounded [`pool::ClientPool`].
//!
//! Only the responder role is driven. One connection carries one request at
//! a time; the protocol's request-id multiplexing is deliberately unused.

pub mod client;
pub mod conn;
pub mod error;
pub mod handler;
pub mod pipe;
pub mod pool;
pub mod protocol;

pub use client::{
    Client, ClientConnInfo, ClientFactory, ClientHandle, FcgiRequest, IdPool, LazyClientFactory,
    SimpleClientFactory,
};
pub use conn::{Backend, ConnFactory, Connection, SimpleConnFactory};
pub use error::Error;
pub use handler::{Gateway, Middleware, RequestHandler};
pub use pipe::{HttpResponder, ResponsePipe};
pub use pool::{ClientPool, PooledClient};
pub use protocol::Role;
