//! Interceptor chain and typed repositories.
//!
//! Every persistence operation runs through an [`InterceptorChain`] ending in
//! a [`StoreTerminal`]: reads hit the entity store, writes are staged into a
//! unit of work.

pub mod chain;
pub mod interceptors;
pub mod operation;
pub mod repository;

pub use chain::{Interceptor, InterceptorChain, Next, Terminal};
pub use interceptors::{AuditInterceptor, OptimisticLockInterceptor, SoftDeleteInterceptor};
pub use operation::{
    DeleteMode, Operation, OperationContext, OperationOutcome, RecordDelete, RecordUpdate,
};
pub use relaykit_uow::AfterCommit;
pub use repository::{Entity, Repository, StoreTerminal};
