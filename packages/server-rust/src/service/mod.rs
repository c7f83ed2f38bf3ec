//! Operation lifecycle: registry, dispatcher and the workers behind async verbs.
//!
//! 1. **Registry** (`registry`): in-memory map of operation id to state
//! 2. **Dispatcher** (`dispatcher`): runs sync verbs inline, hands async ones off
//! 3. **Supervisor** (`supervisor`): owns async workers and their cancellation
//! 4. **Transfer** (`transfer`): backup and restore data movement through the Pit store
//! 5. **Background workers** (`worker`): periodic purge of expired operations

pub mod config;
pub mod dispatcher;
pub mod operation;
pub mod registry;
pub mod supervisor;
pub mod transfer;
pub mod worker;

pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use operation::{OperationError, VerbOutcome};
pub use registry::{OperationRegistry, RegistryError};
pub use supervisor::Supervisor;
pub use worker::{BackgroundRunnable, BackgroundWorker, MaintenanceTask, PurgeRunnable};
