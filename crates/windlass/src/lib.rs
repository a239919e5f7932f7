//! # Windlass
//!
//! A durable workflow orchestration engine: write ordinary procedural
//! `async` code whose execution survives process crashes, restarts, and
//! arbitrary wall-clock delays.
//!
//! ## How it works
//!
//! - **Event-sourced histories**: every externally visible step (activities,
//!   timers, signals, sub-workflows, side effects) is recorded as an event;
//!   the append-only history is the only authoritative state.
//! - **Deterministic replay**: workflow functions re-run from the top on
//!   every task, on a single-threaded cooperative scheduler, with every
//!   future short-circuited from history. Replay divergence is detected and
//!   fails the task before anything is committed.
//! - **Commands and events**: workflow code emits commands (intent); the
//!   worker translates them into durable events and messages, committed
//!   atomically through the backend contract.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowExecutor                        │
//! │   (cooperative scheduler, replay, command reconciliation)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Backend                             │
//! │   (event store + task queue; leases, visibility barriers)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Worker / Client                         │
//! │   (poll → execute → commit; create, signal, await result)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use windlass::prelude::*;
//!
//! async fn transfer(ctx: WorkflowContext, input: TransferInput) -> Result<Receipt, WorkflowError> {
//!     let debit: DebitResult = ctx
//!         .schedule_activity_with_options(
//!             ActivityOptions::default().with_retry(RetryPolicy::exponential()),
//!             "debit",
//!             &input.from,
//!         )
//!         .await?;
//!
//!     ctx.schedule_timer(Duration::from_secs(30)).await?;
//!
//!     let credit: CreditResult = ctx.schedule_activity("credit", &input.to).await?;
//!     Ok(Receipt { debit, credit })
//! }
//!
//! let mut registry = Registry::new();
//! registry.add_workflow("transfer", transfer);
//! registry.add_activity("debit", debit_activity);
//! registry.add_activity("credit", credit_activity);
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let worker = Worker::new(backend.clone(), Arc::new(registry), WorkerOptions::default());
//! worker.start().await?;
//! ```

pub mod activity;
pub mod backend;
pub mod client;
pub mod clock;
pub mod command;
pub mod executor;
pub mod history;
pub mod instance;
pub mod payload;
pub mod registry;
pub mod retry;
pub mod testing;
pub mod worker;
pub mod workflow;

mod scheduler;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityContext, ActivityError};
    pub use crate::backend::{Backend, BackendError, InMemoryBackend};
    pub use crate::client::{Client, ClientError, WorkflowInstanceOptions};
    pub use crate::clock::{Clock, MockClock, WallClock};
    pub use crate::executor::{ExecutionResult, ExecutorError, WorkflowExecutor};
    pub use crate::history::{Event, EventAttributes, EventType};
    pub use crate::instance::WorkflowInstance;
    pub use crate::payload::{Converter, JsonConverter, Payload};
    pub use crate::registry::Registry;
    pub use crate::retry::RetryPolicy;
    pub use crate::testing::WorkflowTest;
    pub use crate::worker::{Worker, WorkerOptions};
    pub use crate::workflow::{
        select, ActivityOptions, CancelScope, Channel, SignalChannel, SubWorkflowOptions,
        WorkflowContext, WorkflowError, WorkflowFuture,
    };
}

// Re-export key types at crate root
pub use activity::{ActivityContext, ActivityError};
pub use backend::{Backend, BackendError, InMemoryBackend};
pub use client::{Client, ClientError, WorkflowInstanceOptions};
pub use clock::{Clock, MockClock, WallClock};
pub use executor::{ExecutionResult, ExecutorError, WorkflowExecutor};
pub use history::{Event, EventAttributes, EventType};
pub use instance::WorkflowInstance;
pub use payload::{Converter, JsonConverter, Payload};
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerOptions};
pub use workflow::{
    select, ActivityOptions, CancelScope, Channel, SignalChannel, SubWorkflowOptions,
    WorkflowContext, WorkflowError, WorkflowFuture,
};
