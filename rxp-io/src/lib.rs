//! RxP I/O and Platform Abstraction
//!
//! This crate provides the datagram side of RxP: the transport trait the
//! demultiplexer is written against, a UDP implementation, an in-memory
//! lossy network for tests, and a cancellable timer service.

pub mod sim;
pub mod socket;
pub mod timer;
pub mod transport;

pub use sim::{DropFilter, LossPolicy, SimNetwork, SimTransport};
pub use socket::{SocketError, UdpTransport};
pub use timer::{TimerHandle, TimerService};
pub use transport::DatagramTransport;
