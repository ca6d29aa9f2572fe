use drm::control::{connector, crtc, Device as ControlDevice};

/// a crtc the connector could be driven by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcCandidate {
    pub handle: crtc::Handle,
    /// position in the device crtc list, the bit used by `possible_crtcs` masks
    pub index: usize,
    /// currently scanning out a mode
    pub active: bool,
}

pub trait CrtcMapper {
    fn crtc_for_connector(&self, drm: &impl ControlDevice, connector: &connector::Info) -> Option<CrtcCandidate>;
}

/// reuse the crtc the connector is already routed to, otherwise take the
/// first compatible crtc, favoring idle ones
#[derive(Debug, Default)]
pub struct SimpleCrtcMapper;

impl SimpleCrtcMapper {
    pub fn new() -> Self {
        Self
    }

    fn restored_for_connector(
        &self,
        drm: &impl ControlDevice,
        connector: &connector::Info,
        crtcs: &[crtc::Handle],
    ) -> Option<CrtcCandidate> {
        let encoder = drm.get_encoder(connector.current_encoder()?).ok()?;
        let handle = encoder.crtc()?;
        let index = crtcs.iter().position(|crtc| *crtc == handle)?;
        Some(CrtcCandidate { handle, index, active: true })
    }

    fn compatible_with_connector(
        &self,
        drm: &impl ControlDevice,
        connector: &connector::Info,
        crtcs: &[crtc::Handle],
    ) -> Option<Vec<CrtcCandidate>> {
        let res_handle = drm.resource_handles().ok()?;
        let mut compatible = vec![false; crtcs.len()];

        for encoder in connector.encoders().iter().flat_map(|encoder| drm.get_encoder(*encoder)) {
            for crtc in res_handle.filter_crtcs(encoder.possible_crtcs()) {
                if let Some(index) = crtcs.iter().position(|c| *c == crtc) {
                    compatible[index] = true;
                }
            }
        }

        let candidates = crtcs
            .iter()
            .enumerate()
            .filter(|(index, _)| compatible[*index])
            .map(|(index, handle)| CrtcCandidate {
                handle: *handle,
                index,
                active: drm.get_crtc(*handle).map(|info| info.mode().is_some()).unwrap_or(false),
            })
            .collect();

        Some(candidates)
    }
}

impl CrtcMapper for SimpleCrtcMapper {
    fn crtc_for_connector(&self, drm: &impl ControlDevice, connector: &connector::Info) -> Option<CrtcCandidate> {
        let res_handle = drm.resource_handles().ok()?;
        let crtcs = res_handle.crtcs();

        if let Some(restored) = self.restored_for_connector(drm, connector, crtcs) {
            return Some(restored);
        }

        let candidates = self.compatible_with_connector(drm, connector, crtcs)?;
        pick_crtc(&candidates)
    }
}

/// first idle candidate, or the first one when all are busy
pub fn pick_crtc(candidates: &[CrtcCandidate]) -> Option<CrtcCandidate> {
    candidates
        .iter()
        .find(|crtc| !crtc.active)
        .or_else(|| candidates.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn candidate(id: u32, index: usize, active: bool) -> CrtcCandidate {
        CrtcCandidate {
            handle: crtc::Handle::from(NonZeroU32::new(id).unwrap()),
            index,
            active,
        }
    }

    #[test]
    fn prefers_idle_crtc() {
        let candidates = [candidate(40, 0, true), candidate(41, 1, false), candidate(42, 2, false)];
        assert_eq!(pick_crtc(&candidates), Some(candidates[1]));
    }

    #[test]
    fn falls_back_to_busy_crtc() {
        let candidates = [candidate(40, 0, true), candidate(41, 1, true)];
        assert_eq!(pick_crtc(&candidates), Some(candidates[0]));
    }

    #[test]
    fn no_candidate() {
        assert_eq!(pick_crtc(&[]), None);
    }
}
