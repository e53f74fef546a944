//! Headless core of a Gotify companion: the realtime stream, the message
//! cache, notification gating and URL previews.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod companion;
pub mod consts;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod inbox;
pub mod model;
pub mod notifications;
pub mod pause;
pub mod persist;
pub mod preview;
pub mod settings;
pub mod stream;
pub mod util;

pub use companion::Companion;
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, Subscription};
pub use model::{ConnectionState, Message, UrlPreview};
