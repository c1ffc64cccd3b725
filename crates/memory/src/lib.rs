//! Long-term memory for the job plane: embeddings, solution snapshots, and
//! the append-only interaction log.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  valet-memory                                               │
//! │                                                             │
//! │  GistNormalizer   (disfluency strip + symbol expansion)     │
//! │  EmbeddingService (normalize → redb cache → HTTP backend)   │
//! │  SnapshotStore    (slug-n.json solutions + similarity)      │
//! │  IoLog            (append-only JSONL interaction rows)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod embedding;
mod io_log;
mod normalize;
mod snapshot;
mod store;

pub use embedding::{EmbeddingService, similarity};
pub use io_log::{AsyncIoLog, IoEntry, IoLog, IoLogRow};
pub use normalize::{GistNormalizer, normalize_question};
pub use snapshot::{RuntimeStats, SolutionSnapshot, generate_id_hash, microsecond_stamp};
pub use store::SnapshotStore;
