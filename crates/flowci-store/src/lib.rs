pub mod pipelines;
pub mod store;

pub use pipelines::FilePipelines;
pub use store::SqliteStore;
