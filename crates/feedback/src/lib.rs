//! Feedback layer - outcome reports that reinforce or weaken rules.

#![warn(missing_docs, unused_crate_dependencies)]

mod request;
mod processor;

pub use request::FeedbackRequest;
pub use processor::{
    BatchFailure, BatchReport, FeedbackConfig, FeedbackError, FeedbackProcessor, FeedbackResult,
    DEFAULT_STEP,
};
