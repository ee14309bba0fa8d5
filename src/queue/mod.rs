//! Pending-work queue.
//!
//! Candidates observed between dispatcher cycles are appended to a durable
//! JSONL log and read back in insertion order when a cycle runs.
//!
//! # Example
//!
//! ```ignore
//! use akari::queue::CandidateQueue;
//!
//! let queue = CandidateQueue::open("/var/lib/akari/pending.jsonl")?;
//! queue.append(&candidate)?;
//! let pending = queue.drain_all()?;
//! ```

mod candidate_queue;

pub use candidate_queue::CandidateQueue;
