//! Named resource locks shared across processes.

pub mod resource;

pub use resource::ResourceMutex;
