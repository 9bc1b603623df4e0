//! Negotiation synchronization over the ledger bridge.
//!
//! - [`state`]: the base64 JSON state exchanged with the bridge
//! - [`event`]: bridge events and channels
//! - [`publisher`]: the bridge collaborator
//! - [`key_policy`]: when a signer's key must have been valid
//! - [`channel`]: the state machine reacting to bridge events

pub mod channel;
pub mod event;
pub mod key_policy;
pub mod publisher;
pub mod state;

pub use channel::{Proposal, SyncChannel};
pub use event::{BridgeEvent, Channel, EventName};
pub use key_policy::{KeyValidityMode, KeyValidityPolicy, SigningTimePolicy, VerificationTimePolicy};
pub use publisher::{EventPublisher, InMemoryBridge};
pub use state::{ConsentState, FullConsentRequestState};
