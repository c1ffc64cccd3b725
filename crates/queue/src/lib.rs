//! Job lifecycle scheduling: four FIFO stages (todo → running → done/dead),
//! per-user views with role-based filtering, cache-hit decisions against the
//! snapshot store, and a worker loop that drives agent execution.

mod auth;
mod chained;
mod error;
mod fifo;
mod job;
mod router;
mod scheduler;
mod tracker;

pub use auth::{QueueFilter, Requester, authorize_filter};
pub use chained::AgentBackedStage;
pub use error::QueueError;
pub use fifo::FifoQueue;
pub use job::{Job, JobStatus, JobView, two_word_tag};
pub use router::route_question;
pub use scheduler::{EnqueueReceipt, IoSink, QueueName, QueueView, ResetCounts, Scheduler};
pub use tracker::UserJobTracker;
