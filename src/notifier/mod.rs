//! Change notification: commit-time fan-out to live subscriptions.

pub mod event;
pub mod registry;
pub mod stream;

pub use event::{ChangeEvent, ChangeKind, Delta};
pub use registry::{Notifier, NotifierStats, Subscription};
pub use stream::{change_stream, StreamState};
