//! Render sessions and event fan-out.
//!
//! A session pairs one supervised process with one progress parser for a
//! single job execution and publishes what it sees through the [`EventHub`].

mod hub;
mod render;
mod types;

pub use hub::{EventHub, SessionTicket};
pub use render::{RenderJob, RenderSession};
pub use types::{HubConfig, HubError, SessionEvent, SessionMessage, SessionOutcome};
