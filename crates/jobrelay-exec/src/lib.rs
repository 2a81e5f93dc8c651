//! Execution substrates (C5-C8, C11): the handler contract every substrate
//! implements, and the local, parallel, batch, and containerised
//! implementations of it.

pub mod batch;
pub mod handler;
pub mod harness;
pub mod local;
pub mod parallel;

pub use batch::BatchHandler;
pub use handler::{AcceptError, Handler, HandlerEvent, JobFn, Outcome, Task};
pub use harness::{run_harness, HarnessInput, HarnessResult, HostRunner};
pub use local::LocalHandler;
pub use parallel::ParallelHandler;
