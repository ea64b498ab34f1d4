// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Types shared between the node daemon, its step managers and clients.

pub mod auth;
pub mod credential;
pub mod hostlist;
pub mod ids;
pub mod protocol;
pub mod transport;

pub use auth::{Envelope, Signer};
pub use credential::LaunchCredential;
pub use ids::{JobId, StepId, StepKey, WHOLE_JOB};
pub use protocol::{IoHeader, Message, Response, ResponseBody, ReturnCode};
pub use transport::{Connection, TcpTransport, Transport, TransportError};
