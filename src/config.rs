use std::{ffi::OsString, path::PathBuf};

use clap::Parser;
use kms_scanner::ModeRequest;

use crate::render::ContentMode;

/// spin a cube on a kms output, pipelining the gpu and the display through fences
#[derive(Debug, Parser)]
#[command(name = "atomflip", after_help = "environment:\n    ATOMFLIP_LEGACY=1    same as --legacy\n    RUST_LOG             log filter")]
pub struct Args {
    /// use atomic modesetting and fencing (default)
    #[arg(short = 'A', long, conflicts_with = "legacy")]
    pub atomic: bool,

    /// use set_crtc and page_flip
    #[arg(short = 'L', long)]
    pub legacy: bool,

    /// drm device, discovered through udev when absent
    #[arg(short = 'D', long, env = "ATOMFLIP_DEVICE")]
    pub device: Option<PathBuf>,

    /// smooth, rgba, nv12-2img, nv12-1img or video
    #[arg(short = 'M', long = "mode", default_value_t = ContentMode::Smooth)]
    pub content: ContentMode,

    /// video mode, <name>[-<vrefresh>] such as 1920x1080-60
    #[arg(short = 'v', long)]
    pub vmode: Option<ModeRequest>,

    /// stop after N frames, 0 runs forever
    #[arg(short = 'n', long, default_value_t = 0)]
    pub frames: u64,

    /// raw rgba frames for the video mode
    #[arg(short = 'V', long, requires = "video_size", required_if_eq("content", "video"))]
    pub video: Option<PathBuf>,

    /// frame size of the video file, <W>x<H>
    #[arg(long, value_name = "WxH", value_parser = parse_size, requires = "video")]
    pub video_size: Option<(u32, u32)>,

    /// write logs to this file instead of stderr
    #[arg(long, env = "ATOMFLIP_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConfig {
    pub path: PathBuf,
    pub size: (u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub device: Option<PathBuf>,
    pub atomic: bool,
    pub content: ContentMode,
    pub mode: Option<ModeRequest>,
    /// `None` runs until an error
    pub frames: Option<u64>,
    pub video: Option<VideoConfig>,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: std::env::var_os("ATOMFLIP_DEVICE").map(PathBuf::from),
            atomic: !env("ATOMFLIP_LEGACY"),
            content: ContentMode::default(),
            mode: None,
            frames: None,
            video: None,
            log_file: std::env::var_os("ATOMFLIP_LOG_FILE").map(PathBuf::from),
        }
    }
}

impl Config {
    /// parse the process arguments over the environment defaults
    ///
    /// prints usage and exits on `--help` or malformed arguments
    pub fn setup() -> Config {
        Config::from_args(Config::default(), Args::parse())
    }

    /// like [`Config::setup`] for an explicit argument list, program name first
    pub fn try_from_iter<I, S>(base: Config, args: I) -> Result<Config, clap::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString> + Clone,
    {
        Ok(Config::from_args(base, Args::try_parse_from(args)?))
    }

    /// apply parsed command line `args` over `base`
    pub fn from_args(base: Config, args: Args) -> Config {
        let atomic = match (args.atomic, args.legacy) {
            (_, true) => false,
            (true, _) => true,
            _ => base.atomic,
        };
        let video = match (args.video, args.video_size) {
            (Some(path), Some(size)) => Some(VideoConfig { path, size }),
            _ => base.video,
        };

        Config {
            device: args.device.or(base.device),
            atomic,
            content: args.content,
            mode: args.vmode.or(base.mode),
            frames: (args.frames > 0).then_some(args.frames).or(base.frames),
            video,
            log_file: args.log_file.or(base.log_file),
        }
    }
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    value
        .split_once('x')
        .and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)))
        .filter(|&(w, h): &(u32, u32)| w > 0 && h > 0)
        .ok_or_else(|| format!("expected <W>x<H>, got `{value}`"))
}

fn env(key: &str) -> bool {
    matches!(std::env::var(key).as_deref(), Ok("1"))
}

#[cfg(test)]
mod tests {
    use clap::{error::ErrorKind, CommandFactory};

    use super::*;

    fn base() -> Config {
        Config {
            device: None,
            atomic: true,
            content: ContentMode::Smooth,
            mode: None,
            frames: None,
            video: None,
            log_file: None,
        }
    }

    fn args(args: &[&str]) -> Result<Config, clap::Error> {
        Config::try_from_iter(base(), std::iter::once("atomflip").chain(args.iter().copied()))
    }

    fn error_kind(argv: &[&str]) -> ErrorKind {
        args(argv).unwrap_err().kind()
    }

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn no_arguments_keeps_defaults() {
        assert_eq!(args(&[]).unwrap(), base());
    }

    #[test]
    fn short_and_long_options() {
        let config = args(&["-L", "-D", "/dev/dri/card1", "--mode", "rgba", "-v", "1280x720-60", "-n", "120"]).unwrap();
        assert!(!config.atomic);
        assert_eq!(config.device, Some(PathBuf::from("/dev/dri/card1")));
        assert_eq!(config.content, ContentMode::Rgba);
        assert_eq!(config.mode, Some("1280x720-60".parse().unwrap()));
        assert_eq!(config.frames, Some(120));
    }

    #[test]
    fn inline_long_values() {
        let config = args(&["--device=/dev/dri/card0", "--frames=0", "--mode=nv12-2img"]).unwrap();
        assert_eq!(config.device, Some(PathBuf::from("/dev/dri/card0")));
        assert_eq!(config.frames, None);
        assert_eq!(config.content, ContentMode::Nv12TwoImages);
    }

    #[test]
    fn atomic_flag_overrides_legacy_environment() {
        let base = Config { atomic: false, ..base() };
        let config = Config::try_from_iter(base.clone(), ["atomflip", "-A"]).unwrap();
        assert!(config.atomic);
        assert!(!Config::try_from_iter(base, ["atomflip"]).unwrap().atomic);
    }

    #[test]
    fn video_mode_needs_a_source() {
        assert_eq!(error_kind(&["-M", "video"]), ErrorKind::MissingRequiredArgument);
        assert_eq!(error_kind(&["-V", "clip.rgba"]), ErrorKind::MissingRequiredArgument);

        let config = args(&["-M", "video", "-V", "clip.rgba", "--video-size", "320x240"]).unwrap();
        assert_eq!(config.video, Some(VideoConfig { path: "clip.rgba".into(), size: (320, 240) }));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(error_kind(&["--bogus"]), ErrorKind::UnknownArgument);
        assert_eq!(error_kind(&["-A", "-L"]), ErrorKind::ArgumentConflict);
        assert!(args(&["-D"]).is_err());
        assert!(args(&["-n", "many"]).is_err());
        assert!(args(&["-M", "nv12"]).is_err());
        assert!(args(&["-v", "1920x1080-fast"]).is_err());
        assert!(args(&["-V", "a", "--video-size", "0x240"]).is_err());
        assert_eq!(error_kind(&["-h"]), ErrorKind::DisplayHelp);
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("640x480"), Ok((640, 480)));
        assert!(parse_size("640").is_err());
        assert!(parse_size("0x480").is_err());
        assert!(parse_size("axb").is_err());
    }
}
