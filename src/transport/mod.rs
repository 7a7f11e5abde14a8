pub mod fabric;
pub mod sim;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use fabric::{
    Access, CmChannel, CmEvent, CmEventKind, CmId, CompletionDevice, CompletionKind,
    CompletionStatus, ConnParams, Fabric, MemoryRegistration, QpCaps, QueuePair, RecvRequest,
    RemoteTarget, Sge, WorkCompletion, WorkOp, WorkRequest, WrKind, WrTag,
};
pub use sim::SimFabric;
#[cfg(feature = "verbs")]
pub use verbs::VerbsFabric;
