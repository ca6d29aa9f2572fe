use std::{fmt, str::FromStr};

use drm::control::{Mode, ModeTypeFlags};

/// timing summary of a connector mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    pub name: String,
    pub size: (u16, u16),
    pub vrefresh: u32,
    pub preferred: bool,
}

impl ModeInfo {
    pub fn new(name: impl Into<String>, size: (u16, u16), vrefresh: u32) -> Self {
        Self { name: name.into(), size, vrefresh, preferred: false }
    }

    pub fn preferred(mut self) -> Self {
        self.preferred = true;
        self
    }

    pub fn area(&self) -> u32 {
        self.size.0 as u32 * self.size.1 as u32
    }
}

impl From<&Mode> for ModeInfo {
    fn from(mode: &Mode) -> Self {
        Self {
            name: mode.name().to_string_lossy().into_owned(),
            size: mode.size(),
            vrefresh: mode.vrefresh(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        }
    }
}

impl fmt::Display for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.size.0, self.size.1, self.vrefresh)
    }
}

/// user constraint on mode selection, written as `<name>[-<vrefresh>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeRequest {
    pub name: String,
    pub vrefresh: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid mode string `{0}`, expected <name>[-<vrefresh>]")]
pub struct ParseModeError(String);

impl FromStr for ModeRequest {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, vrefresh) = match s.rsplit_once('-') {
            Some((name, refresh)) => {
                let refresh = refresh.parse().map_err(|_| ParseModeError(s.into()))?;
                (name, Some(refresh))
            }
            None => (s, None),
        };
        if name.is_empty() {
            return Err(ParseModeError(s.into()));
        }
        Ok(Self { name: name.into(), vrefresh })
    }
}

/// pick a mode index out of `modes`
///
/// with a request, modes named exactly like it are considered first: an exact
/// refresh match wins, else the closest refresh (ties go to the higher one),
/// else, when no refresh was asked, the highest refresh.
/// without a match, the preferred mode wins, then the largest area.
pub fn select_mode(modes: &[ModeInfo], request: Option<&ModeRequest>) -> Option<usize> {
    if let Some(request) = request {
        match select_requested(modes, request) {
            Some(index) => return Some(index),
            None => tracing::warn!("requested mode {request:?} not found, using default mode"),
        }
    }

    if let Some(index) = modes.iter().position(|mode| mode.preferred) {
        return Some(index);
    }

    modes
        .iter()
        .enumerate()
        .fold(None::<(usize, u32)>, |best, (index, mode)| match best {
            Some((_, area)) if area >= mode.area() => best,
            _ => Some((index, mode.area())),
        })
        .map(|(index, _)| index)
}

fn select_requested(modes: &[ModeInfo], request: &ModeRequest) -> Option<usize> {
    let named = modes
        .iter()
        .enumerate()
        .filter(|(_, mode)| mode.name == request.name);

    match request.vrefresh {
        Some(vrefresh) => named
            .min_by_key(|(_, mode)| (mode.vrefresh.abs_diff(vrefresh), u32::MAX - mode.vrefresh))
            .map(|(index, _)| index),
        None => named
            .min_by_key(|(_, mode)| u32::MAX - mode.vrefresh)
            .map(|(index, _)| index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_wins_over_area() {
        let modes = [
            ModeInfo::new("1920x1080", (1920, 1080), 60).preferred(),
            ModeInfo::new("1280x720", (1280, 720), 60),
            ModeInfo::new("3840x2160", (3840, 2160), 30),
        ];
        assert_eq!(select_mode(&modes, None), Some(0));
    }

    #[test]
    fn largest_area_without_preferred() {
        let modes = [
            ModeInfo::new("1280x720", (1280, 720), 60),
            ModeInfo::new("1920x1080", (1920, 1080), 60),
        ];
        assert_eq!(select_mode(&modes, None), Some(1));
    }

    #[test]
    fn first_of_equal_area_is_kept() {
        let modes = [
            ModeInfo::new("1920x1080", (1920, 1080), 60),
            ModeInfo::new("1920x1080", (1920, 1080), 50),
        ];
        assert_eq!(select_mode(&modes, None), Some(0));
    }

    #[test]
    fn empty_list_selects_nothing() {
        assert_eq!(select_mode(&[], None), None);
    }

    #[test]
    fn request_by_name_and_refresh() {
        let modes = [
            ModeInfo::new("1920x1080", (1920, 1080), 60).preferred(),
            ModeInfo::new("1280x720", (1280, 720), 60),
            ModeInfo::new("1280x720", (1280, 720), 50),
        ];
        let request: ModeRequest = "1280x720-50".parse().unwrap();
        assert_eq!(select_mode(&modes, Some(&request)), Some(2));
    }

    #[test]
    fn request_without_refresh_takes_highest() {
        let modes = [
            ModeInfo::new("1280x720", (1280, 720), 50),
            ModeInfo::new("1280x720", (1280, 720), 60),
            ModeInfo::new("1280x720", (1280, 720), 30),
        ];
        let request: ModeRequest = "1280x720".parse().unwrap();
        assert_eq!(select_mode(&modes, Some(&request)), Some(1));
    }

    #[test]
    fn request_closest_refresh_prefers_higher_on_tie() {
        let modes = [
            ModeInfo::new("1280x720", (1280, 720), 50),
            ModeInfo::new("1280x720", (1280, 720), 60),
        ];
        let request: ModeRequest = "1280x720-55".parse().unwrap();
        assert_eq!(select_mode(&modes, Some(&request)), Some(1));

        let request: ModeRequest = "1280x720-52".parse().unwrap();
        assert_eq!(select_mode(&modes, Some(&request)), Some(0));
    }

    #[test]
    fn unknown_request_falls_back_to_default() {
        let modes = [
            ModeInfo::new("1280x720", (1280, 720), 60),
            ModeInfo::new("1920x1080", (1920, 1080), 60),
        ];
        let request: ModeRequest = "800x600".parse().unwrap();
        assert_eq!(select_mode(&modes, Some(&request)), Some(1));
    }

    #[test]
    fn parse_mode_strings() {
        assert_eq!(
            "1920x1080-60".parse::<ModeRequest>(),
            Ok(ModeRequest { name: "1920x1080".into(), vrefresh: Some(60) })
        );
        assert_eq!(
            "1920x1080i".parse::<ModeRequest>(),
            Ok(ModeRequest { name: "1920x1080i".into(), vrefresh: None })
        );
        assert!("1920x1080-abc".parse::<ModeRequest>().is_err());
        assert!("-60".parse::<ModeRequest>().is_err());
    }
}
