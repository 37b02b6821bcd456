mod forge_error;

pub use forge_error::{ErrorKind, ForgeError};
