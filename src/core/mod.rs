pub mod cache;
pub mod events;
pub mod pipeline;
pub mod store;
pub mod trend;
pub mod worker;
