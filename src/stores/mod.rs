pub mod file_secret_store;
pub mod memory_secret_store;

pub use file_secret_store::FileSecretStore;
pub use memory_secret_store::MemorySecretStore;
