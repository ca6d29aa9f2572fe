use drm::control::Device as ControlDevice;
use libdisplay_info::info::Info;

use crate::properties::PropertySet;

/// `make model` of the monitor behind a connector, decoded from its EDID blob
pub fn monitor_name(device: &impl ControlDevice, connector_props: &PropertySet) -> Option<String> {
    let edid = connector_props.get("EDID")?;
    if edid.value == 0 {
        return None;
    }

    let data = device.get_property_blob(edid.value).ok()?;
    let info = Info::parse_edid(&data).ok()?;

    let make = info.make().unwrap_or_else(|| "Unknown".into());
    let model = info.model().unwrap_or_else(|| "Unknown".into());
    Some(format!("{make} {model}"))
}
