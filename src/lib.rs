//! # sandbox-stream
//!
//! Run commands inside container sandboxes and collect their exit code,
//! stdout and stderr, optionally delivering output to callbacks while the
//! command is still running.
//!
//! ```no_run
//! use sandbox_stream::{SandboxSession, StreamCallback};
//!
//! # async fn example() -> sandbox_stream::Result<()> {
//! let session = SandboxSession::builder().build().await?;
//! let results = session
//!     .run(
//!         ["echo A; sleep 0.1; echo B"],
//!         Some(StreamCallback::new(|chunk| print!("{chunk}"))),
//!         None,
//!     )
//!     .await?;
//! assert_eq!(results[0].stdout, "A\nB\n");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - `execution` - Decoding, accumulation, stream processors and the coordinator
//! - `transport` - Output transport contracts shared by the backends
//! - `backend` - Local, Docker/Podman, Kubernetes and mock exec backends
//! - `session` - Sequential command batches against one container
//! - `config` - Session configuration from TOML and the environment
//! - `cli` - The `sandbox-stream` command-line surface
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod session;
pub mod transport;


pub use error::{ExecError, PartialOutput, Result, TIMEOUT_EXIT_CODE};
pub use execution::{CommandResult, CommandSpec, DecodePolicy, StreamCallback};
pub use session::SandboxSession;
