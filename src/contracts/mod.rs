pub mod failure;

pub use failure::{BackendError, FailureClassification, FATAL_ERROR_CODES};
