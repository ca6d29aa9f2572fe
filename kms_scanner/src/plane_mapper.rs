use std::io;

use drm::control::{crtc, plane, Device as ControlDevice, PlaneType, ResourceHandles};

use crate::properties::PropertySet;

/// a plane able to feed the chosen crtc
#[derive(Debug, Clone)]
pub struct PlaneCandidate {
    pub handle: plane::Handle,
    pub kind: Option<PlaneType>,
    pub props: PropertySet,
}

/// planes whose `possible_crtcs` include `crtc`, with their property tables
pub fn compatible_planes(
    drm: &impl ControlDevice,
    resources: &ResourceHandles,
    crtc: crtc::Handle,
) -> io::Result<Vec<PlaneCandidate>> {
    let mut candidates = vec![];

    for handle in drm.plane_handles()? {
        let info = match drm.get_plane(handle) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(?handle, "failed to query plane: {err}");
                continue;
            }
        };

        if !resources.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
            continue;
        }

        let props = PropertySet::fetch(drm, handle)?;
        let kind = props.get("type").and_then(|entry| plane_type(entry.value));
        candidates.push(PlaneCandidate { handle, kind, props });
    }

    Ok(candidates)
}

/// decode the value of the `type` plane property
pub fn plane_type(value: u64) -> Option<PlaneType> {
    [PlaneType::Overlay, PlaneType::Primary, PlaneType::Cursor]
        .into_iter()
        .find(|kind| *kind as u64 == value)
}

/// primary planes first, then overlays; cursor planes are never used for scanout
pub fn pick_plane(candidates: &[PlaneCandidate]) -> Option<&PlaneCandidate> {
    candidates
        .iter()
        .find(|plane| plane.kind == Some(PlaneType::Primary))
        .or_else(|| candidates.iter().find(|plane| plane.kind == Some(PlaneType::Overlay)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn candidate(id: u32, kind: Option<PlaneType>) -> PlaneCandidate {
        PlaneCandidate {
            handle: plane::Handle::from(NonZeroU32::new(id).unwrap()),
            kind,
            props: PropertySet::new(),
        }
    }

    #[test]
    fn primary_preferred_over_overlay() {
        let planes = [
            candidate(31, Some(PlaneType::Overlay)),
            candidate(32, Some(PlaneType::Cursor)),
            candidate(33, Some(PlaneType::Primary)),
        ];
        assert_eq!(pick_plane(&planes).map(|p| p.handle), Some(planes[2].handle));
    }

    #[test]
    fn overlay_when_no_primary() {
        let planes = [candidate(32, Some(PlaneType::Cursor)), candidate(31, Some(PlaneType::Overlay))];
        assert_eq!(pick_plane(&planes).map(|p| p.handle), Some(planes[1].handle));
    }

    #[test]
    fn cursor_only_is_unusable() {
        let planes = [candidate(32, Some(PlaneType::Cursor)), candidate(34, None)];
        assert!(pick_plane(&planes).is_none());
    }

    #[test]
    fn decode_plane_type() {
        assert_eq!(plane_type(0), Some(PlaneType::Overlay));
        assert_eq!(plane_type(1), Some(PlaneType::Primary));
        assert_eq!(plane_type(2), Some(PlaneType::Cursor));
        assert_eq!(plane_type(7), None);
    }
}
