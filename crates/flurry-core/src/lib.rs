//! flurry-core: Shared library for the flurry relay proxy.
//!
//! Provides broker wire messages, NAT classification, the token-bucket rate
//! limiter shared by all sessions, SDP/URL parsing helpers, a fixed-capacity
//! ring buffer for statistics, and the abstract transport traits that the
//! session engine is written against.

pub mod error;
pub mod messages;
pub mod parse;
pub mod rate_limit;
pub mod ring_buffer;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{FlurryError, FlurryResult};
pub use messages::{NatType, SdpType, SessionDescription, PROTOCOL_VERSION};
pub use parse::{build_url, check_relay_pattern, ip_from_sdp, normalize_broker_url};
pub use rate_limit::{BucketRateLimit, RateLimit, SharedRateLimit, UnlimitedRate};
pub use ring_buffer::RingBuffer;
pub use transport::{ChannelEvent, DataChannel, PeerConnection, PeerEvent, PeerFactory, RelayDialer};
