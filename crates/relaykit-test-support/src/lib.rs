//! Shared test doubles for the relaykit workspace.

mod bus;
mod cache;
mod clock;
mod rng;
mod store;

pub use bus::{FailingBus, FlakyBus, RecordingBus};
pub use cache::{FailingCache, HangingCache};
pub use clock::{FixedClock, ManualClock};
pub use rng::{FixedRng, MockRng, SequenceRng};
pub use store::InMemoryStore;
