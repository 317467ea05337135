#![warn(missing_docs)]

//! afscm RPC subsystem: file-server call surface, connection cache, liveness prober, replica fanout

pub mod config;
pub mod conn;
pub mod error;
pub mod fanout;
pub mod prober;
pub mod server;
pub mod types;
pub mod volume;

pub use config::RpcConfig;
pub use conn::{ConnHandle, ConnKey, ConnStatus, ConnectionCache};
pub use error::{ErrorClass, Result, RpcError};
pub use fanout::{FanoutContext, Outcome, Step};
pub use prober::Prober;
pub use server::{Connector, FileServer, Probe, Service, TimeProbe};
pub use types::{
    AccessRights, AclReply, CallbackGrant, CreateReply, Credential, DataReply, FetchStatus,
    FileId, FileType, LeaseKind, LinkReply, RenameReply, SecurityIndex, StatusReply, StoreStatus,
    StoreVolumeStatus, VolSync, VolumeStatus,
};
pub use volume::{Replica, ReplicaFlags, VolumeEntry, VolumeKind, VolumeLocator};
