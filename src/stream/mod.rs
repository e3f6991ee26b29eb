//! Token streaming bridge.
//!
//! Runs a blocking [`Pipeline`](crate::traits::Pipeline) on its own thread
//! and hands its output to the request handler as it is produced.
//!
//! ```text
//!  request thread                         worker thread
//!  ──────────────                         ─────────────
//!  stream() ──spawn──────────────────────▶ install RequestContext
//!     │                                    pipeline.run(listener)
//!     │        ┌───────── relay ────────┐    ├─ on_token ──▶ Token
//!  TokenStream ◀ Token │ End(inner) │ …  ◀─  ├─ on_run_end ▶ End(inner)
//!     │        └────────────────────────┘    └─ guard ─────▶ End(outer)
//!     │
//!  End(outer) ──▶ join ──▶ fallback from FinalResult if nothing streamed
//! ```
//!
//! Every run, including the model calls nested inside the pipeline, closes
//! with a terminal marker tagged by its [`RunId`]. Only the marker of the
//! outer run ends the consumer's iteration.

mod adapter;
mod listener;
mod relay;
mod task;

pub use adapter::{split_preserving_whitespace, stream, TokenStream};
pub use listener::{is_streaming_config, GenerationListener, NoopListener, RelayListener};
pub use relay::{relay, RelayItem, RelayReceiver, RelaySender, RunId};
pub use task::{BackgroundTask, TaskOutcome};
