//! moving commits to a device that cannot reach the build host

pub mod http;
pub mod remote;
pub mod serve;
pub mod ssh;

pub use http::{pull_http, HttpSource};
pub use remote::{
    CommandOutput, Connector, DeviceCommands, RemoteExecutor, RemoteSession, RemoteState,
    RemoteTarget, TunnelBinding,
};
pub use serve::ContentServer;
pub use ssh::{OpenSshConnector, OpenSshSession};
