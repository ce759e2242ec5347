/// Coin daemon communication and job templates

pub mod rpc_client;
pub mod template_manager;

pub use rpc_client::{CoinDaemon, DaemonClient, PendingBlock, WorkPackage};
pub use template_manager::{BlockTemplate, BlockTemplateManager, HeaderInfo, TemplateSource};
