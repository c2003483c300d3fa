//! Cancellable async counting semaphore for the compio runtime
//!
//! This crate provides a bounded counting semaphore compatible with the
//! [compio](https://github.com/compio-rs/compio) async runtime. The semaphore
//! limits the number of concurrent holders of a logical resource to a fixed
//! capacity chosen at construction, which makes it the building block for
//! throttling concurrent tasks, outbound connections, or in-flight requests.
//!
//! # Operations
//!
//! - [`Semaphore::acquire`] - suspend until a slot is free
//! - [`Semaphore::acquire_or_cancel`] - suspend until a slot is free or a
//!   caller-supplied cancellation token fires, whichever happens first
//! - [`Semaphore::try_acquire`] - claim a slot only if one is free right now
//!
//! Slots are released by dropping the [`SemaphorePermit`] returned from a
//! successful acquisition, so a claimed slot can never be released twice or
//! forgotten.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_semaphore::Semaphore;
//! use std::sync::Arc;
//!
//! #[compio::main]
//! async fn main() {
//!     let sem = Arc::new(Semaphore::new(100));
//!
//!     // Spawn many tasks, but only 100 run concurrently
//!     for i in 0..1000 {
//!         let sem = sem.clone();
//!         compio::runtime::spawn(async move {
//!             let _permit = sem.acquire().await;
//!             println!("Task {}", i);
//!         });
//!     }
//! }
//! ```

mod error;
mod semaphore;

pub use error::AcquireError;
pub use semaphore::{Semaphore, SemaphorePermit};
