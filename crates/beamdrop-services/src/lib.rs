//! beamdrop-services — discovery, link sessions and the transfer protocol.

pub mod coordinator;
pub mod engine;
pub mod link;
pub mod loopback;
pub mod peer;
pub mod receiver;

pub use coordinator::{TransferCoordinator, TransferHandle};
pub use engine::{Outcome, TransferError, TransferEvent, TransferSource, TransferState};
pub use link::{LinkError, LinkSession, LinkState, Radio, StreamLink};
pub use peer::{Discovery, DiscoveryEvent, Peer};
pub use receiver::{ReceivedFile, ReceiveError, TransferReceiver};
