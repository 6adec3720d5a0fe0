pub mod backend;
pub mod intake;
pub mod jobs;
pub mod subscription;
