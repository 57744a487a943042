pub mod engine;
pub mod message;
pub mod retry;
pub mod subscription;
pub mod topic;

pub use engine::Broker;

#[cfg(test)]
mod tests;
