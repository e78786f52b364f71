pub mod api;
pub mod checkpoint;
pub mod job;
pub mod listing;
pub mod photo;
pub mod strategy;
