//! Session establishment and the authenticated peer channel.

pub mod channel;
pub mod session;
pub mod signaling;

pub use channel::{open_channel, ChannelReader, ChannelWriter, DataStream};
pub use session::{
    endpoint_fingerprint, handshake, keepalive_loop, PeerSession, SessionShared, SessionState,
    SessionTransition,
};
pub use signaling::{
    MatchRole, MemorySignaling, Signaling, SignalingEvent, SignalingRequest, SlotRequirements,
    WebSocketSignaling,
};
