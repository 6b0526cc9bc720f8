pub mod blue;
pub mod callback;
pub mod config;
pub mod error;
pub mod failure;
pub mod gpu;
pub mod logging;
pub mod model;
pub mod secrets;
pub mod store;
pub mod store_mongo;
pub mod trustee;

pub use error::{InsufficientGpu, StoreError, TrusteeError};
pub use model::{Batch, BatchState, Experiment, Id, NodeMirror, NodeState};
pub use store::{Store, StoreResult};
