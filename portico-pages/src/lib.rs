//! Sticky, worker-affine page registry and the real-time page protocol.
//!
//! Long-lived per-user page objects stay alive in the worker that owns
//! them, so WebSocket push reaches them without cross-worker chatter on
//! the hot path. A page id carries its owner's index (`<id>|pNN`); the
//! sticky router steers `hash(identity) mod N` and rehydrates pages from
//! dead workers on the next round-trip. Cross-worker fan-out rides the
//! topic bus from `portico-events`.

mod connection;
mod page;
mod registry;
mod sticky;

pub mod protocol;

pub use connection::{
    PageConnectionHandler, PagesConfig, PAGE_OPEN_CHANNEL, RELOCATED_CHANNEL,
};
pub use page::{Enqueued, OutboundFrame, OverflowPolicy, Page, PageId};
pub use protocol::{RpcErrorBody, RpcMessage};
pub use registry::PageRegistry;
pub use sticky::{Placement, Shard, StickyRouter};
