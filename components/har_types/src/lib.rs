// HAR vocabulary shared between the network observer and its consumers
//
// This module is part of the netmonitor network observer.

pub mod errors;
pub mod network;
pub mod timings;

// Re-export commonly used types
pub use errors::{ChannelError, ObserverError};
pub use network::{
    Cookie, Header, NetworkEvent, PostData, ResponseContent, ResponseStart, ServerTiming,
};
pub use timings::{HarOffsets, HarPhase, HarTimingResult, HarTimings, NOT_OBSERVED};
