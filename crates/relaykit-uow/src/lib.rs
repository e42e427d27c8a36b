//! Unit of work with a transactional outbox.
//!
//! Entity writes and the outbox rows for the events raised alongside them are
//! committed in one store transaction. Events are then published immediately;
//! anything the bus does not accept stays in the outbox for the relay.

pub mod outbox_writer;
pub mod unit_of_work;

pub use outbox_writer::OutboxWriter;
pub use unit_of_work::{
    AfterCommit, CommitReceipt, UnitOfWork, UnitOfWorkConfig, UnitOfWorkFactory, UnitOfWorkState,
};
