use std::io;

use drm::control::{connector, Device as ControlDevice};

#[derive(Debug, Default)]
pub struct ConnectorScanner {
    connectors: Vec<connector::Info>,
}

impl ConnectorScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// scan every connector of the device
    pub fn scan(&mut self, drm: &impl ControlDevice) -> io::Result<&[connector::Info]> {
        let res_handle = drm.resource_handles()?;

        self.connectors = res_handle
            .connectors()
            .iter()
            .filter_map(|conn| match drm.get_connector(*conn, true) {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!(?conn, "failed to scan connector: {err}");
                    None
                }
            })
            .collect();

        Ok(&self.connectors)
    }

    pub fn connectors(&self) -> &[connector::Info] {
        &self.connectors
    }

    /// first connector reporting a connected display
    pub fn connected(&self) -> Option<&connector::Info> {
        first_connected(self.connectors.iter().map(connector::Info::state))
            .map(|index| &self.connectors[index])
    }
}

/// index of the first connected state, in enumeration order
pub fn first_connected(states: impl IntoIterator<Item = connector::State>) -> Option<usize> {
    states
        .into_iter()
        .position(|state| state == connector::State::Connected)
}

/// `<interface>-<id>`, e.g. `HDMI-A-1`
pub fn connector_name(info: &connector::Info) -> String {
    format!("{}-{}", info.interface().as_str(), info.interface_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm::control::connector::State;

    #[test]
    fn picks_first_connected() {
        let states = [State::Disconnected, State::Unknown, State::Connected, State::Connected];
        assert_eq!(first_connected(states), Some(2));
    }

    #[test]
    fn exactly_one_is_selected() {
        let states = [State::Connected, State::Connected];
        assert_eq!(first_connected(states), Some(0));
    }

    #[test]
    fn nothing_connected() {
        assert_eq!(first_connected([State::Disconnected, State::Unknown]), None);
        assert_eq!(first_connected([]), None);
    }
}
