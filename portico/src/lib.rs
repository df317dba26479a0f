//! Portico - an HTTP + WebSocket application server runtime.
//!
//! This facade crate re-exports the Portico sub-crates through a single
//! dependency. Import everything you need with:
//!
//! ```ignore
//! use portico::prelude::*;
//! ```
//!
//! | Module | Crate |
//! |---|---|
//! | `codec` | `portico-codec` |
//! | (top level) | `portico-core` |
//! | `executor` | `portico-executor` |
//! | `events` | `portico-events` |
//! | `pages` | `portico-pages` |
//! | `http` | `portico-http` |

pub use portico_codec as codec;
pub use portico_events as events;
pub use portico_executor as executor;
pub use portico_http as http;
pub use portico_pages as pages;

// Everything from the core at the top level for convenience.
pub use portico_core::*;

pub mod prelude {
    //! One-stop imports for application authors.
    pub use portico_codec::TypedValue;
    pub use portico_core::prelude::*;
    pub use portico_events::TopicBus;
    pub use portico_pages::{PageConnectionHandler, PagesConfig};
}
