//! Execution side of a job: running the worker program and collecting what
//! it produced.
//!
//! # Components
//!
//! - [`WorkerInvoker`]: launches the worker process and turns its exit
//!   status into a [`WorkerOutcome`]
//! - [`ResultLocator`]: ranks the files a worker left in its output
//!   directory
//!
//! # Worker contract
//!
//! Workers are started as
//! `<interpreter> <script> <input> <output_dir> <job_id> [extra..]`.
//! Exit status 0 means success, 2 means the portal rejected the stored
//! credentials, anything else is a failure explained on stderr.

pub mod executor;
pub mod results;

pub use executor::{classify_failure, WorkerInvoker, WorkerOutcome, EXIT_INVALID_CREDENTIALS};
pub use results::ResultLocator;
