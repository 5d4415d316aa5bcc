pub mod executor;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;
pub mod stream;

pub use executor::{CommandRunner, CommandSpec, DEFAULT_TIMEOUT, KILL_GRACE, TokioCommandRunner};
#[cfg(any(test, feature = "scripted"))]
pub use scripted::{LaunchEvent, ScriptedResponse, ScriptedRunner};
pub use stream::{CommandStream, ExitOutcome};
