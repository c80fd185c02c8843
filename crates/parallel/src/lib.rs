//! Parallel chunked transfer: sender and receiver orchestration.
//!
//! # Pipeline
//!
//! 1. **Initiate**: announce the transfer; the hash is still `"pending"`
//! 2. **Approve**: optionally poll until the receiver accepts
//! 3. **Upload**: N lanes push their round-robin share of chunks, with retry
//! 4. **Hash**: runs in the background from the start, over the source file
//! 5. **Complete**: send the digest; the receiver finalizes and verifies
//!
//! The crate has no transport of its own. [`PeerTransport`] is implemented by
//! the TCP data channel and by [`LoopbackTransport`] for in-process use.

pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod pool;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod transport;

pub use config::{
    ApprovalMode, CollisionPolicy, ReceiverConfig, RetryPolicy, SenderConfig, Timeouts,
};
pub use error::{ReceiveError, SendError, TransportError};
pub use events::{Direction, EventBus, TransferEvent, TransferProgress};
pub use keys::{KeyProvider, StaticKeys};
pub use pool::ConnectionPool;
pub use receiver::{ParallelReceiver, ReceivePhase, ReceiveSnapshot};
pub use registry::{RegistryError, SessionRegistry};
pub use sender::{ParallelSender, SendOutcome, SendPhase, SendRequest, SendSnapshot};
pub use transport::{LoopbackTransport, PeerTransport, TransportFuture};
