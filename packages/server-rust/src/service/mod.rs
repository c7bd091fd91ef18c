//! Service lifecycle and operation execution.
//!
//! 1. **Declarations** (`providers`): static `(service, variant) -> factory` table
//! 2. **Registry** (`registry`): activation states and the lazy activator
//! 3. **Dispatch** (`dispatch`): per-provider operation tables with a fallback slot
//! 4. **Middleware** (`middleware`): Tower layers (timeout, metrics) around dispatch
//! 5. **Errors** (`operation`): the gateway error taxonomy and its faults

pub mod config;
pub mod dispatch;
pub mod middleware;
pub mod operation;
pub mod providers;
pub mod registry;

pub use config::{ServerConfig, DEFAULT_VARIANT};
pub use dispatch::{
    DispatchError, DispatchService, DispatchTable, DispatchTableBuilder, Fallback, HandlerError,
    Invocation,
};
pub use middleware::{build_invocation_pipeline, InvocationPipeline};
pub use operation::{GatewayError, INTERNAL_ERROR_MESSAGE};
pub use providers::ProviderRegistry;
pub use registry::{
    ActivationError, ActiveService, ServiceRegistry, ServiceState, ServiceStatus, ShutdownReport,
};
