use std::time::Duration;

use scopewire_rpc::{ErrorKind, Fault};

/// Outcome of a device call that did not succeed.
///
/// Cloneable because one reply can complete several waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("no reply for '{key}' within {after:?}")]
    Timeout { key: String, after: Duration },

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("device reported error {code}: {text}")]
    DeviceReported { code: String, text: String },

    #[error("serial line lost: {0}")]
    Disconnected(String),

    #[error("message manager stopped")]
    Stopped,

    #[error("call interrupted")]
    Interrupted,

    #[error("cannot encode instruction: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

impl From<DeviceError> for Fault {
    fn from(err: DeviceError) -> Self {
        let kind = match &err {
            DeviceError::Timeout { .. } => ErrorKind::Timeout,
            DeviceError::Malformed(_) => ErrorKind::Malformed,
            DeviceError::DeviceReported { .. } => ErrorKind::RuntimeFault,
            DeviceError::Disconnected(_) | DeviceError::Stopped => ErrorKind::DeviceDisconnected,
            DeviceError::Interrupted => ErrorKind::Interrupted,
            DeviceError::Encode(_) => ErrorKind::BadRequest,
        };
        Fault::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_rpc_error_kinds() {
        let timeout: Fault = DeviceError::Timeout {
            key: "7123".into(),
            after: Duration::from_secs(2),
        }
        .into();
        assert_eq!(timeout.kind, ErrorKind::Timeout);
        assert_eq!(Fault::from(DeviceError::Stopped).kind, ErrorKind::DeviceDisconnected);
        assert_eq!(
            Fault::from(DeviceError::DeviceReported {
                code: "1".into(),
                text: "71123".into()
            })
            .kind,
            ErrorKind::RuntimeFault
        );
    }
}
