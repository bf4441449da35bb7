pub mod artifact;
pub mod detection;
pub mod job;
pub mod responses;
