use std::{fmt, io};

use drm::control::{property, Device as ControlDevice, RawResourceHandle, ResourceHandle};

/// kind of a kms object participating in the display chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Connector,
    Crtc,
    Plane,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Connector => "connector",
            ObjectKind::Crtc => "crtc",
            ObjectKind::Plane => "plane",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEntry {
    pub name: String,
    pub handle: property::Handle,
    /// value at discovery time
    pub value: property::RawValue,
}

/// ordered `name -> property id` table of one kms object
///
/// resolved once at discovery, every transaction reuses it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    entries: Vec<PropertyEntry>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// fetch the full property table of `handle`
    pub fn fetch<H: ResourceHandle>(drm: &impl ControlDevice, handle: H) -> io::Result<Self> {
        let values = drm.get_properties(handle)?;
        let mut set = Self::new();
        for (prop, value) in values {
            let info = drm.get_property(prop)?;
            let name = info.name().to_string_lossy().into_owned();
            set.push(name, prop, value);
        }
        Ok(set)
    }

    pub fn push(&mut self, name: impl Into<String>, handle: property::Handle, value: property::RawValue) {
        self.entries.push(PropertyEntry { name: name.into(), handle, value });
    }

    pub fn get(&self, name: &str) -> Option<&PropertyEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn handle(&self, name: &str) -> Option<property::Handle> {
        self.get(name).map(|entry| entry.handle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, property::Handle, property::RawValue)> for PropertySet {
    fn from_iter<T: IntoIterator<Item = (String, property::Handle, property::RawValue)>>(iter: T) -> Self {
        let mut set = Self::new();
        for (name, handle, value) in iter {
            set.push(name, handle, value);
        }
        set
    }
}

/// small integer index into an [`ObjectArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayObject {
    pub kind: ObjectKind,
    pub handle: RawResourceHandle,
    pub props: PropertySet,
}

/// immutable records for every object of the display chain
///
/// filled once by the scanner, read-only afterwards
#[derive(Debug, Clone, Default)]
pub struct ObjectArena {
    objects: Vec<DisplayObject>,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ObjectKind, handle: RawResourceHandle, props: PropertySet) -> ObjectId {
        self.objects.push(DisplayObject { kind, handle, props });
        ObjectId(self.objects.len() - 1)
    }

    pub fn get(&self, id: ObjectId) -> &DisplayObject {
        &self.objects[id.0]
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
