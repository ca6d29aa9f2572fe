use std::{
    fs::{File, OpenOptions},
    os::fd::{AsFd, BorrowedFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use drm::{
    control::{connector::State, Device as ControlDevice},
    ClientCapability, Device,
};

use crate::{Error, Result};

/// an opened drm card node
///
/// cheap to clone, every clone shares the same descriptor
#[derive(Debug, Clone)]
pub struct Card {
    file: Arc<File>,
    path: PathBuf,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(path: impl AsRef<Path>) -> Result<Card> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| Error::NoDisplayDevice(format!("{}: {err}", path.display())))?;

        tracing::info!("opened {}", path.display());
        Ok(Card { file: Arc::new(file), path: path.into() })
    }

    /// first drm card with a connected output
    pub fn discover() -> Result<Card> {
        let udev = libudev::Context::new().map_err(|err| Error::NoDisplayDevice(format!("udev: {err}")))?;
        let mut scanner =
            libudev::Enumerator::new(&udev).map_err(|err| Error::NoDisplayDevice(format!("udev: {err}")))?;
        scanner
            .match_subsystem("drm")
            .map_err(|err| Error::NoDisplayDevice(format!("udev: {err}")))?;

        let mut nodes: Vec<PathBuf> = scanner
            .scan_devices()
            .map_err(|err| Error::NoDisplayDevice(format!("udev: {err}")))?
            .filter(|device| device.sysname().is_some_and(|name| name.to_string_lossy().starts_with("card")))
            .filter_map(|device| device.devnode().map(Path::to_path_buf))
            .collect();
        nodes.sort();

        for node in nodes {
            let card = match Card::open(&node) {
                Ok(card) => card,
                Err(err) => {
                    tracing::debug!("skipping {}: {err}", node.display());
                    continue;
                }
            };
            if card.has_connected_output() {
                return Ok(card);
            }
            tracing::debug!("no connected output on {}", node.display());
        }

        Err(Error::NoDisplayDevice("no drm card with a connected output".into()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// expose every plane, and the atomic api when `atomic` is set
    pub fn set_client_capabilities(&self, atomic: bool) -> Result<()> {
        self.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|_| Error::MissingCapability("universal planes".into()))?;
        if atomic {
            self.set_client_capability(ClientCapability::Atomic, true)
                .map_err(|_| Error::MissingCapability("atomic modesetting".into()))?;
        }
        Ok(())
    }

    fn has_connected_output(&self) -> bool {
        let Ok(resources) = self.resource_handles() else {
            return false;
        };
        resources.connectors().iter().any(|conn| {
            self.get_connector(*conn, false)
                .map(|info| info.state() == State::Connected)
                .unwrap_or(false)
        })
    }
}
