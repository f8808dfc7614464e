//! Ingestion: notices in, index writes out.
//!
//! A notice is first written to the [`Stash`], then queued on the [`Mux`],
//! whose workers apply it through an [`Apply`] implementation (normally the
//! [`Indexer`]). Callers wait for consistency by polling [`Mux::eta`] with
//! the dependency keys returned on submission.

pub mod indexer;
pub mod mux;
pub mod notice;
pub mod stash;

pub use indexer::{namespace, Apply, Indexer};
pub use mux::Mux;
pub use notice::{Bout, Message, Notice};
pub use stash::Stash;
