use afscm_rpc::{FileId, RpcError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rpc(RpcError),

    #[error("not connected")]
    NotConnected,

    #[error("cache out of space: need {needed} bytes")]
    NoSpace { needed: u64 },

    #[error("cache out of nodes")]
    NoNodes,

    #[error("no such volume {volume} in cell {cell}")]
    NoSuchVolume { cell: i32, volume: u32 },

    #[error("{fid} is not a mount point")]
    NotMountpoint { fid: FileId },

    #[error("unknown cell {name}")]
    UnknownCell { name: String },

    #[error("used bytes {counter} but entries hold {sum}")]
    AccountingViolation { counter: u64, sum: u64 },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Invalid configuration: {msg}")]
    InvalidConfig { msg: String },

    #[error("state file: {0}")]
    State(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<RpcError> for CacheError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::NotConnected => CacheError::NotConnected,
            other => CacheError::Rpc(other),
        }
    }
}

impl CacheError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            CacheError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            CacheError::Rpc(e) => rpc_errno(e),
            CacheError::NotConnected => ENETDOWN,
            CacheError::NoSpace { .. } => ENOSPC,
            CacheError::NoNodes => ENFILE,
            CacheError::NoSuchVolume { .. } => ENODEV,
            CacheError::NotMountpoint { .. } => EINVAL,
            CacheError::UnknownCell { .. } => ENOENT,
            CacheError::AccountingViolation { .. } => EIO,
            CacheError::InvalidArgument { .. } => EINVAL,
            CacheError::InvalidConfig { .. } => EINVAL,
            CacheError::State(_) => EIO,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::AccountingViolation { .. })
    }
}

fn rpc_errno(err: &RpcError) -> i32 {
    use libc::*;
    match err {
        RpcError::CallDead { .. } | RpcError::Timeout { .. } => ETIMEDOUT,
        RpcError::ConnectionRefused { .. } => ECONNREFUSED,
        RpcError::NoSuchVolume { .. } | RpcError::VolumeMoved { .. } => ENODEV,
        RpcError::VolumeOffline { .. } | RpcError::VolumeSalvage { .. } => EIO,
        RpcError::Busy | RpcError::Restarting => EBUSY,
        RpcError::AccessDenied => EACCES,
        RpcError::NoSuchObject => ENOENT,
        RpcError::Exists => EEXIST,
        RpcError::NotEmpty => ENOTEMPTY,
        RpcError::NotDirectory => ENOTDIR,
        RpcError::IsDirectory => EISDIR,
        RpcError::ReadOnly => EROFS,
        RpcError::QuotaExceeded => EDQUOT,
        RpcError::InvalidArgument { .. } => EINVAL,
        RpcError::Remote(_) => EIO,
        RpcError::NotConnected => ENETDOWN,
        RpcError::NoReplicas { .. } => ENODEV,
        RpcError::AllReplicasDown { .. } => ETIMEDOUT,
    }
}
