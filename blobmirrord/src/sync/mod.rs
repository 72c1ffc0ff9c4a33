pub mod batch;
pub mod cache;
pub mod engine;
pub mod events;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
