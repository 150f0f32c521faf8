//! The foreman runtime engine.
//!
//! Everything that moves lives here: the store repositories, the broker
//! port and its Postgres implementation, the task registry, the worker,
//! the queue manager, the health monitor, the alarm engine, and the
//! shutdown controller, assembled into a single [`Engine`] value.

#[macro_use]
extern crate serde;

mod engine;
mod manager;
mod registry;
mod worker;

pub mod alarm;
pub mod broker;
pub mod flag;
pub mod health;
pub mod shutdown;
pub mod store;

pub use self::engine::Engine;
pub use self::manager::{NewQueue, QueueHealthObserver, QueueManager, QueueUpdate, TaskSnapshot};
pub use self::registry::TaskRegistry;
pub use self::worker::{Worker, WorkerBuilder, WorkerHandle, WorkerOptions};
