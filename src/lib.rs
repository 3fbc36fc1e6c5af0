#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
pub mod graph;
#[cfg(feature = "logging")]
pub mod logging;
#[cfg(feature = "server")]
pub mod server;
pub mod watch;

#[cfg(feature = "watch")]
pub use crate::error::WatchError;
pub use crate::error::{GraphError, InputError};
pub use crate::graph::{Dynamic, Event, Graph, Inputs, TaskOutput, TaskSpec};
pub use crate::watch::{ChangeEvent, ChangeKind};
