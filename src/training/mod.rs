//! Training Infrastructure
//!
//! Checkpoint persistence and episode metrics.

pub mod checkpointing;
pub mod metrics;

pub use checkpointing::{episode_name, load_agent, record_path, save_agent, Checkpointer};
pub use metrics::{AggregatedMetrics, EpisodeMetrics};
