//! Cached entity records.

mod model;
mod repository;

pub(crate) use model::{format_timestamp, format_timestamp_opt, parse_timestamp, parse_timestamp_opt};
pub use model::RecordDB;
pub use repository::RecordRepository;
