use std::io;

use drm::control::{connector, crtc, plane, Device as ControlDevice, Mode};

use crate::{
    compatible_planes, connector_name, display_info, pick_plane, select_mode, ConnectorScanner,
    CrtcMapper, ModeInfo, ModeRequest, ObjectArena, ObjectId, ObjectKind, PropertySet,
    SimpleCrtcMapper,
};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to query display resources: {0}")]
    Resources(#[source] io::Error),
    #[error("device exposes no connectors")]
    NoConnectors,
    #[error("no connected connector")]
    NoConnectedConnector,
    #[error("connector {0} reports no modes")]
    NoModes(String),
    #[error("no crtc available for connector {0}")]
    NoCrtc(String),
    #[error("no plane usable with crtc {0:?}")]
    NoPlane(crtc::Handle),
    #[error("failed to read {kind} properties: {source}")]
    Properties {
        kind: ObjectKind,
        #[source]
        source: io::Error,
    },
}

/// the selected connector -> crtc -> plane chain and its timing
///
/// every object and its property table lives in `objects`
#[derive(Debug, Clone)]
pub struct DisplayChain {
    pub name: String,
    pub monitor: Option<String>,
    pub objects: ObjectArena,
    pub connector: ObjectId,
    pub crtc: ObjectId,
    pub plane: ObjectId,
    pub crtc_index: usize,
    pub mode: ModeInfo,
}

impl DisplayChain {
    pub fn connector_handle(&self) -> connector::Handle {
        self.objects.get(self.connector).handle.into()
    }

    pub fn crtc_handle(&self) -> crtc::Handle {
        self.objects.get(self.crtc).handle.into()
    }

    pub fn plane_handle(&self) -> plane::Handle {
        self.objects.get(self.plane).handle.into()
    }
}

/// outcome of [`DrmScanner::scan`]
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub chain: DisplayChain,
    /// kernel descriptor of `chain.mode`, used for mode blobs and legacy modesets
    pub mode: Mode,
}

#[derive(Debug, Default)]
pub struct DrmScanner<Mapper = SimpleCrtcMapper>
where
    Mapper: CrtcMapper,
{
    connectors: ConnectorScanner,
    crtc_mapper: Mapper,
}

impl DrmScanner {
    /// scanner with the default crtc mapper, see [`DrmScanner::new_with_mapper`]
    /// for a custom one
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Mapper> DrmScanner<Mapper>
where
    Mapper: CrtcMapper,
{
    pub fn new_with_mapper(crtc_mapper: Mapper) -> Self {
        Self { connectors: Default::default(), crtc_mapper }
    }

    pub fn crtc_mapper(&self) -> &Mapper {
        &self.crtc_mapper
    }

    pub fn connectors(&self) -> &ConnectorScanner {
        &self.connectors
    }

    /// pick the display chain to drive and resolve the property tables of
    /// its connector, crtc and plane
    pub fn scan(&mut self, drm: &impl ControlDevice, request: Option<&ModeRequest>) -> Result<ScanResult, ScanError> {
        let resources = drm.resource_handles().map_err(ScanError::Resources)?;

        if self.connectors.scan(drm).map_err(ScanError::Resources)?.is_empty() {
            return Err(ScanError::NoConnectors);
        }

        let connector = self
            .connectors
            .connected()
            .ok_or(ScanError::NoConnectedConnector)?
            .clone();
        let name = connector_name(&connector);
        tracing::debug!("using connector {name}");

        let modes: Vec<ModeInfo> = connector.modes().iter().map(ModeInfo::from).collect();
        let mode_index = select_mode(&modes, request).ok_or_else(|| ScanError::NoModes(name.clone()))?;
        let mode = connector.modes()[mode_index];
        let mode_info = modes[mode_index].clone();

        let crtc = self
            .crtc_mapper
            .crtc_for_connector(drm, &connector)
            .ok_or_else(|| ScanError::NoCrtc(name.clone()))?;

        let planes = compatible_planes(drm, &resources, crtc.handle).map_err(|source| {
            ScanError::Properties { kind: ObjectKind::Plane, source }
        })?;
        let plane = pick_plane(&planes).ok_or(ScanError::NoPlane(crtc.handle))?;

        let connector_props = PropertySet::fetch(drm, connector.handle())
            .map_err(|source| ScanError::Properties { kind: ObjectKind::Connector, source })?;
        let crtc_props = PropertySet::fetch(drm, crtc.handle)
            .map_err(|source| ScanError::Properties { kind: ObjectKind::Crtc, source })?;

        let monitor = display_info::monitor_name(drm, &connector_props);

        let mut objects = ObjectArena::new();
        let connector_id = objects.insert(ObjectKind::Connector, connector.handle().into(), connector_props);
        let crtc_id = objects.insert(ObjectKind::Crtc, crtc.handle.into(), crtc_props);
        let plane_id = objects.insert(ObjectKind::Plane, plane.handle.into(), plane.props.clone());

        tracing::info!(
            crtc = ?crtc.handle,
            plane = ?plane.handle,
            kind = ?plane.kind,
            "display {name} ({}) using mode {mode_info}",
            monitor.as_deref().unwrap_or("unknown monitor"),
        );

        let chain = DisplayChain {
            name,
            monitor,
            objects,
            connector: connector_id,
            crtc: crtc_id,
            plane: plane_id,
            crtc_index: crtc.index,
            mode: mode_info,
        };

        Ok(ScanResult { chain, mode })
    }
}
