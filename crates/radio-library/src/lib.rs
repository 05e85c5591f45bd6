//! Station library and playback session core.
//!
//! The library half (`store`, `merge`, `view`, `share`, `export`) owns the
//! user's station collection and every rule that keeps it consistent.  The
//! playback half (`session`, `listening`) drives exactly one stream at a
//! time through a [`session::StreamBackend`] and reports transitions as
//! events.  The two halves only meet through station identities, so a
//! playback failure can never leave the library half-mutated.

pub mod catalog;
pub mod config;
pub mod debounce;
pub mod error;
pub mod export;
pub mod kv;
pub mod listening;
pub mod merge;
pub mod model;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod share;
pub mod starter;
pub mod store;
pub mod view;

pub use error::{CatalogError, ImportError, LibraryError, StorageError};
pub use listening::ListeningTimeAccumulator;
pub use merge::{ImportMode, ImportReport, MergeResolver};
pub use model::{DedupKey, PresetSlot, StationCandidate, StationId, StationPatch, StationRecord};
pub use session::{Phase, PlaybackSession, SessionEvent, StationRef, StreamBackend};
pub use store::{LibraryEvent, LibraryStore};
pub use view::SortOption;
