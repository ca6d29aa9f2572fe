//! discovery of a single connector -> crtc -> plane display chain

pub mod display_info;
pub mod mode;
pub mod properties;
mod connector_scanner;
mod crtc_mapper;
mod plane_mapper;
mod scanner;

pub use connector_scanner::{connector_name, first_connected, ConnectorScanner};
pub use crtc_mapper::{pick_crtc, CrtcCandidate, CrtcMapper, SimpleCrtcMapper};
pub use mode::{select_mode, ModeInfo, ModeRequest, ParseModeError};
pub use plane_mapper::{compatible_planes, pick_plane, plane_type, PlaneCandidate};
pub use properties::{DisplayObject, ObjectArena, ObjectId, ObjectKind, PropertyEntry, PropertySet};
pub use scanner::{DisplayChain, DrmScanner, ScanError, ScanResult};
