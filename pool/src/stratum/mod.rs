/// Stratum front end
///
/// Classic polling (`eth_*`) and EthereumStratum/1.0.0 (`mining.*`) miners
/// share one listener. The dialect is fixed by the first negotiating call.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use error::SessionError;
pub use protocol::{Dialect, Request, Response, RpcError};
pub use registry::{BroadcastReport, SessionRegistry};
pub use server::StratumServer;
pub use session::{JobDetails, JobPayload, PushOutcome, Session};
