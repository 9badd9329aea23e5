//! yuebridge: editor bridge for the YueScript checker worker.

pub mod bridge;
pub mod controller;
pub mod diagnostics;
mod error;
pub mod scheduler;
pub mod supervisor;
pub mod transport;

pub use error::BridgeError;

pub use bridge::codec::{CodecError, FrameCodec, FrameStyle, JsonCodec, MAX_FRAME_BYTES};
pub use bridge::protocol::{CheckConfig, CheckReply, CheckRequest, WorkerMessage};
pub use controller::{BridgeController, ControllerConfig};
pub use diagnostics::{Diagnostic, DiagnosticsSink, Position, Range, Severity, map_reply};
pub use scheduler::{DispatchPolicy, Session, SessionConfig};
pub use supervisor::{WorkerConfig, WorkerProcess, WorkerSpawner, YueSpawner};
pub use transport::{Transport, WorkerTransport};
