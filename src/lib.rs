#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod codec;
mod dispatcher;
mod error;
mod message;
mod pipe;
mod queue;
mod service;
mod session;
mod space;
mod transport;
mod wire;

pub use codec::*;
pub use dispatcher::*;
pub use error::*;
pub use message::*;
pub use pipe::*;
pub use queue::*;
pub use service::*;
pub use session::*;
pub use space::*;
pub use transport::*;
pub use wire::*;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use asterisque::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Abort, CallContext, Dispatcher, Message, PipeHandle, Service, Session, SessionOptions,
        Transport, Wire, WireOptions,
    };
}
