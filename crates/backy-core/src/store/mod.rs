pub mod local;

pub use local::{reassemble, LocalBlobStore};
