//! Durable state: claims, thread contexts, and the local work queues.

mod db;

pub use db::{DbHandle, WorkerDb};
