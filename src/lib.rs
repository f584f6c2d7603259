//! A POSIX jobserver compatible with GNU make.
//!
//! A [`Client`] hands out tokens from the jobserver this process inherited
//! through `MAKEFLAGS`, topped up by a local budget when there is no parent.
//! A [`Server`] relays a client's tokens to a child process over a fresh
//! pair of pipes, so the child can act as a client in turn.
//!
//! ```no_run
//! use jobserver::{Client, Env};
//!
//! # fn main() -> Result<(), jobserver::JobserverError> {
//! let client = Client::from_env(&Env::inherit())?;
//! let token = client.acquire();
//! // ... run one job ...
//! drop(token);
//! # Ok(())
//! # }
//! ```

/// Log an error.
///
/// # Example
///
/// ```no_run
/// # use jobserver::log_err;
/// # fn main() {
/// log_err!("{} has failed", "everything");
/// # }
/// ```
#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::meta("error", s.trim_end(), None);
    }}
}

/// Log a warning.
///
/// # Example
///
/// ```no_run
/// # use jobserver::log_warn;
/// # fn main() {
/// log_warn!("{} has failed", "something non-critical");
/// # }
/// ```
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::meta("warning", s.trim_end(), None);
    }}
}

/// Log a debug message.
///
/// # Example
///
/// ```no_run
/// # use jobserver::log_debug;
/// # fn main() {
/// log_debug!("some details");
/// # }
/// ```
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        if $crate::logs::debug_level() >= 1 {
            let s = format!($($arg)*);
            $crate::logs::meta("debug", s.trim_end(), None);
        }
    }}
}

/// Log a verbose debug message.
///
/// # Example
///
/// ```no_run
/// # use jobserver::log_debug2;
/// # fn main() {
/// log_debug2!("some verbose details");
/// # }
/// ```
#[macro_export]
macro_rules! log_debug2 {
    ($($arg:tt)*) => {{
        if $crate::logs::debug_level() >= 2 {
            let s = format!($($arg)*);
            $crate::logs::meta("debug", s.trim_end(), None);
        }
    }}
}

mod client;
mod command;
mod config;
mod env;
mod error;
mod exits;
mod helpers;
pub mod logs;
mod makeflags;
mod pipe;
mod pool;
mod server;

pub use client::{Acquired, Client};
pub use command::ChildCommand;
pub use config::Config;
pub use env::{Env, OptionalBool, MAKEFLAGS_VAR};
pub use error::{fatal, JobserverError, JobserverErrorKind, ProtocolError};
pub use exits::{EXIT_BAD_MAKEFLAGS, EXIT_FAILURE, EXIT_NOT_RECURSIVE, EXIT_SUCCESS};
pub use makeflags::{JobLimit, Makeflags};
pub use server::{Server, ServerPhase};
