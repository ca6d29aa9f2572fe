use std::io;

use kms_scanner::{ObjectKind, ScanError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// coarse classification of [`Error`], stable across the detailed variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoDisplayDevice,
    NoConnectedOutput,
    NoCompatibleCrtcOrPlane,
    UnknownProperty,
    TransactionRejected,
    MissingCapability,
    BufferImportFailed,
    Device,
    Egl,
    Render,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no display device available: {0}")]
    NoDisplayDevice(String),
    #[error("no connected display output")]
    NoConnectedOutput,
    #[error("no compatible crtc or plane: {0}")]
    NoCompatibleCrtcOrPlane(String),
    #[error("{object} has no property `{name}`")]
    UnknownProperty { object: ObjectKind, name: &'static str },
    #[error("atomic transaction rejected: {0}")]
    TransactionRejected(#[source] io::Error),
    #[error("missing capability: {0}")]
    MissingCapability(String),
    #[error("failed to import buffer as framebuffer: {0}")]
    BufferImportFailed(#[source] io::Error),
    #[error("failed to {op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("egl: {0}")]
    Egl(String),
    #[error("render: {0}")]
    Render(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoDisplayDevice(_) => ErrorKind::NoDisplayDevice,
            Error::NoConnectedOutput => ErrorKind::NoConnectedOutput,
            Error::NoCompatibleCrtcOrPlane(_) => ErrorKind::NoCompatibleCrtcOrPlane,
            Error::UnknownProperty { .. } => ErrorKind::UnknownProperty,
            Error::TransactionRejected(_) => ErrorKind::TransactionRejected,
            Error::MissingCapability(_) => ErrorKind::MissingCapability,
            Error::BufferImportFailed(_) => ErrorKind::BufferImportFailed,
            Error::Device { .. } => ErrorKind::Device,
            Error::Egl(_) => ErrorKind::Egl,
            Error::Render(_) => ErrorKind::Render,
        }
    }

    pub(crate) fn device(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Device { op, source }
    }

    pub(crate) fn egl(error: impl std::fmt::Display) -> Self {
        Error::Egl(error.to_string())
    }
}

impl From<ScanError> for Error {
    fn from(error: ScanError) -> Self {
        match error {
            ScanError::NoConnectors | ScanError::NoConnectedConnector => Error::NoConnectedOutput,
            ScanError::NoModes(_) => Error::NoConnectedOutput,
            ScanError::NoCrtc(_) | ScanError::NoPlane(_) => Error::NoCompatibleCrtcOrPlane(error.to_string()),
            ScanError::Resources(source) => Error::Device { op: "query display resources", source },
            ScanError::Properties { source, .. } => Error::Device { op: "read object properties", source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_errors_map_to_taxonomy() {
        assert_eq!(Error::from(ScanError::NoConnectedConnector).kind(), ErrorKind::NoConnectedOutput);
        assert_eq!(Error::from(ScanError::NoConnectors).kind(), ErrorKind::NoConnectedOutput);
        assert_eq!(
            Error::from(ScanError::NoCrtc("HDMI-A-1".into())).kind(),
            ErrorKind::NoCompatibleCrtcOrPlane,
        );
        let err = Error::from(ScanError::Resources(io::Error::from_raw_os_error(13)));
        assert_eq!(err.kind(), ErrorKind::Device);
    }

    #[test]
    fn unknown_property_names_object() {
        let err = Error::UnknownProperty { object: ObjectKind::Plane, name: "IN_FENCE_FD" };
        assert_eq!(err.to_string(), "plane has no property `IN_FENCE_FD`");
    }
}
