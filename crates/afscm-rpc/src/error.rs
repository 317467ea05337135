use std::net::Ipv4Addr;
use thiserror::Error;

/// How the fanout reacts to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Host or network failure: mark the connection dead, try the next replica.
    Transient,
    /// The volume location is out of date: refresh it once and retry.
    StaleLocation,
    /// The replica cannot serve this volume right now.
    VolumeScope,
    /// Server busy or restarting: wait and retry the same replica.
    Busy,
    /// Permission or semantic failure, never retried.
    Semantic,
    /// Local condition, nothing was sent.
    Local,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("call to {host} is dead")]
    CallDead { host: Ipv4Addr },

    #[error("call to {host} timed out after {timeout_ms}ms")]
    Timeout { host: Ipv4Addr, timeout_ms: u64 },

    #[error("connection refused by {host}")]
    ConnectionRefused { host: Ipv4Addr },

    #[error("no such volume {volume}")]
    NoSuchVolume { volume: u32 },

    #[error("volume {volume} has moved")]
    VolumeMoved { volume: u32 },

    #[error("volume {volume} is offline")]
    VolumeOffline { volume: u32 },

    #[error("volume {volume} is being salvaged")]
    VolumeSalvage { volume: u32 },

    #[error("server busy")]
    Busy,

    #[error("server restarting")]
    Restarting,

    #[error("access denied")]
    AccessDenied,

    #[error("no such file or directory")]
    NoSuchObject,

    #[error("name already exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("read-only volume")]
    ReadOnly,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("remote error code {0}")]
    Remote(i32),

    #[error("not connected")]
    NotConnected,

    #[error("no replica of volume {volume} in cell {cell}")]
    NoReplicas { cell: i32, volume: u32 },

    #[error("all replicas of volume {volume} in cell {cell} are down")]
    AllReplicasDown { cell: i32, volume: u32 },
}

pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RpcError::CallDead { .. }
            | RpcError::Timeout { .. }
            | RpcError::ConnectionRefused { .. } => ErrorClass::Transient,
            RpcError::NoSuchVolume { .. } | RpcError::VolumeMoved { .. } => {
                ErrorClass::StaleLocation
            }
            RpcError::VolumeOffline { .. } | RpcError::VolumeSalvage { .. } => {
                ErrorClass::VolumeScope
            }
            RpcError::Busy | RpcError::Restarting => ErrorClass::Busy,
            RpcError::AccessDenied
            | RpcError::NoSuchObject
            | RpcError::Exists
            | RpcError::NotEmpty
            | RpcError::NotDirectory
            | RpcError::IsDirectory
            | RpcError::ReadOnly
            | RpcError::QuotaExceeded
            | RpcError::InvalidArgument { .. }
            | RpcError::Remote(_) => ErrorClass::Semantic,
            RpcError::NotConnected
            | RpcError::NoReplicas { .. }
            | RpcError::AllReplicasDown { .. } => ErrorClass::Local,
        }
    }

    pub fn is_host_down(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_class() {
        let host = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(RpcError::CallDead { host }.class(), ErrorClass::Transient);
        assert_eq!(
            RpcError::Timeout {
                host,
                timeout_ms: 500
            }
            .class(),
            ErrorClass::Transient
        );
        assert!(RpcError::ConnectionRefused { host }.is_host_down());
    }

    #[test]
    fn test_volume_errors_split_by_class() {
        assert_eq!(
            RpcError::VolumeMoved { volume: 7 }.class(),
            ErrorClass::StaleLocation
        );
        assert_eq!(
            RpcError::NoSuchVolume { volume: 7 }.class(),
            ErrorClass::StaleLocation
        );
        assert_eq!(
            RpcError::VolumeOffline { volume: 7 }.class(),
            ErrorClass::VolumeScope
        );
    }

    #[test]
    fn test_busy_is_not_host_down() {
        assert_eq!(RpcError::Busy.class(), ErrorClass::Busy);
        assert!(!RpcError::Restarting.is_host_down());
    }

    #[test]
    fn test_semantic_errors() {
        for err in [
            RpcError::AccessDenied,
            RpcError::NoSuchObject,
            RpcError::Exists,
            RpcError::NotEmpty,
            RpcError::Remote(-451),
        ] {
            assert_eq!(err.class(), ErrorClass::Semantic, "{}", err);
        }
    }

    #[test]
    fn test_display_mentions_volume() {
        let err = RpcError::AllReplicasDown {
            cell: 1,
            volume: 536870913,
        };
        assert!(err.to_string().contains("536870913"));
    }
}
