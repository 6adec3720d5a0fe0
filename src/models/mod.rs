pub mod credit;
pub mod job;
pub mod profile;
pub mod requests;
