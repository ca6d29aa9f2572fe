use std::{
    ffi::{c_void, CStr},
    os::fd::{FromRawFd, IntoRawFd, OwnedFd},
};

use khronos_egl as egl;

use crate::{
    gpu::{
        image::{ImageFns, ImageImporter, GL_IMAGE_EXTENSIONS, IMAGE_EXTENSIONS, MODIFIERS_EXTENSION},
        scanout::{ScanoutRing, SCANOUT_FORMAT},
    },
    Error, Result,
};

type EglInstance = egl::DynamicInstance<egl::EGL1_5>;

const EGL_PLATFORM_GBM_KHR: egl::Enum = 0x31D7;
const EGL_SYNC_NATIVE_FENCE_ANDROID: egl::Enum = 0x3144;
const EGL_SYNC_NATIVE_FENCE_FD_ANDROID: egl::Int = 0x3145;
const EGL_NO_NATIVE_FENCE_FD_ANDROID: egl::Int = -1;
const EGL_FOREVER_KHR: u64 = u64::MAX;
const EGL_SYNC_FLUSH_COMMANDS_BIT_KHR: egl::Int = 0x0001;

/// extensions required for explicit fencing
pub const FENCE_EXTENSIONS: [&str; 3] =
    ["EGL_KHR_fence_sync", "EGL_KHR_wait_sync", "EGL_ANDROID_native_fence_sync"];

type EglSync = *mut c_void;

#[allow(non_snake_case)]
struct FenceFns {
    eglCreateSyncKHR: unsafe extern "system" fn(*mut c_void, egl::Enum, *const egl::Int) -> EglSync,
    eglDestroySyncKHR: unsafe extern "system" fn(*mut c_void, EglSync) -> egl::Boolean,
    eglWaitSyncKHR: unsafe extern "system" fn(*mut c_void, EglSync, egl::Int) -> egl::Int,
    eglClientWaitSyncKHR: unsafe extern "system" fn(*mut c_void, EglSync, egl::Int, u64) -> egl::Int,
    eglDupNativeFenceFDANDROID: unsafe extern "system" fn(*mut c_void, EglSync) -> egl::Int,
}

fn proc_address(egl: &EglInstance, name: &str) -> Result<extern "system" fn()> {
    egl.get_proc_address(name)
        .ok_or_else(|| Error::MissingCapability(format!("{name} entry point")))
}

impl FenceFns {
    fn load(egl: &EglInstance) -> Result<Self> {
        let proc = |name: &str| proc_address(egl, name);
        // SAFETY: the signatures follow the extension specifications
        unsafe {
            Ok(FenceFns {
                eglCreateSyncKHR: std::mem::transmute(proc("eglCreateSyncKHR")?),
                eglDestroySyncKHR: std::mem::transmute(proc("eglDestroySyncKHR")?),
                eglWaitSyncKHR: std::mem::transmute(proc("eglWaitSyncKHR")?),
                eglClientWaitSyncKHR: std::mem::transmute(proc("eglClientWaitSyncKHR")?),
                eglDupNativeFenceFDANDROID: std::mem::transmute(proc("eglDupNativeFenceFDANDROID")?),
            })
        }
    }
}

/// an egl native fence sync object
#[derive(Debug)]
pub struct NativeSync(EglSync);

/// egl display, context and window surface bound to a [`ScanoutRing`]
pub struct EglContext {
    egl: EglInstance,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    fences: Option<FenceFns>,
    images: Option<ImageFns>,
    /// dma-buf imports may carry format modifiers
    modifiers: bool,
}

impl EglContext {
    pub fn new(ring: &ScanoutRing) -> Result<Self> {
        // SAFETY: loading libEGL runs no initialization code beyond the loader's
        let egl = unsafe { EglInstance::load_required() }.map_err(Error::egl)?;

        // SAFETY: the gbm device outlives the display, see `Gpu` field order
        let display = unsafe { egl.get_platform_display(EGL_PLATFORM_GBM_KHR, ring.device_ptr(), &[egl::ATTRIB_NONE]) }
            .map_err(Error::egl)?;
        let (major, minor) = egl.initialize(display).map_err(Error::egl)?;
        tracing::info!("using egl {major}.{minor}");

        let query = |name| {
            egl.query_string(Some(display), name)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let extensions = query(egl::EXTENSIONS);
        tracing::debug!("egl version \"{}\"", query(egl::VERSION));
        tracing::debug!("egl vendor \"{}\"", query(egl::VENDOR));
        tracing::debug!("egl extensions \"{extensions}\"");

        egl.bind_api(egl::OPENGL_ES_API).map_err(Error::egl)?;
        let config = choose_config(&egl, display)?;
        let context = egl
            .create_context(display, config, None, &[egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE])
            .map_err(Error::egl)?;

        // SAFETY: the gbm surface outlives the egl surface
        let surface = unsafe { egl.create_window_surface(display, config, ring.surface_ptr(), None) }
            .map_err(Error::egl)?;
        egl.make_current(display, Some(surface), Some(surface), Some(context))
            .map_err(Error::egl)?;

        let fences = match has_extensions(&extensions, &FENCE_EXTENSIONS) {
            true => Some(FenceFns::load(&egl)?),
            false => {
                tracing::info!("egl native fences unavailable");
                None
            }
        };

        gl::load_with(|name| {
            egl.get_proc_address(name)
                .map_or(std::ptr::null(), |f| f as *const c_void)
        });
        let gl_extensions = log_gl_strings();

        let images = match has_extensions(&extensions, &IMAGE_EXTENSIONS)
            && has_extensions(&gl_extensions, &GL_IMAGE_EXTENSIONS)
        {
            true => Some(ImageFns::load(|name| proc_address(&egl, name))?),
            false => {
                tracing::info!("dma-buf image import unavailable");
                None
            }
        };
        let modifiers = has_extensions(&extensions, &[MODIFIERS_EXTENSION]);

        Ok(Self { egl, display, context, surface, fences, images, modifiers })
    }

    /// importer for dma-buf backed textures
    ///
    /// fails when the display or the client api lacks the import extensions
    pub fn image_importer(&self) -> Result<ImageImporter> {
        let fns = self.images.ok_or_else(|| {
            let wanted = IMAGE_EXTENSIONS.iter().chain(&GL_IMAGE_EXTENSIONS);
            let wanted: Vec<_> = wanted.copied().collect();
            Error::MissingCapability(format!("dma-buf image import ({})", wanted.join(", ")))
        })?;
        Ok(ImageImporter::new(self.display.as_ptr(), fns, self.modifiers))
    }

    pub fn has_native_fences(&self) -> bool {
        self.fences.is_some()
    }

    pub fn swap_buffers(&self) -> Result<()> {
        self.egl.swap_buffers(self.display, self.surface).map_err(Error::egl)
    }

    fn fences(&self) -> Result<&FenceFns> {
        self.fences
            .as_ref()
            .ok_or_else(|| Error::MissingCapability("egl native fences".into()))
    }

    fn last_error(&self, call: &str) -> Error {
        match self.egl.get_error() {
            Some(err) => Error::Egl(format!("{call}: {err}")),
            None => Error::Egl(format!("{call} failed")),
        }
    }

    pub fn create_native_fence(&self, fd: Option<OwnedFd>) -> Result<NativeSync> {
        let fns = self.fences()?;
        let raw = fd.map_or(EGL_NO_NATIVE_FENCE_FD_ANDROID, IntoRawFd::into_raw_fd);
        let attribs = [EGL_SYNC_NATIVE_FENCE_FD_ANDROID, raw, egl::NONE];

        let sync = unsafe { (fns.eglCreateSyncKHR)(self.display.as_ptr(), EGL_SYNC_NATIVE_FENCE_ANDROID, attribs.as_ptr()) };
        if sync.is_null() {
            if raw >= 0 {
                // ownership only moves to egl on success
                drop(unsafe { OwnedFd::from_raw_fd(raw) });
            }
            return Err(self.last_error("eglCreateSyncKHR"));
        }
        Ok(NativeSync(sync))
    }

    pub fn wait_sync(&self, sync: &NativeSync) -> Result<()> {
        let fns = self.fences()?;
        match unsafe { (fns.eglWaitSyncKHR)(self.display.as_ptr(), sync.0, 0) } {
            0 => Err(self.last_error("eglWaitSyncKHR")),
            _ => Ok(()),
        }
    }

    pub fn client_wait_sync(&self, sync: &NativeSync) -> Result<()> {
        let fns = self.fences()?;
        let status = unsafe {
            (fns.eglClientWaitSyncKHR)(self.display.as_ptr(), sync.0, EGL_SYNC_FLUSH_COMMANDS_BIT_KHR, EGL_FOREVER_KHR)
        };
        match status {
            0 => Err(self.last_error("eglClientWaitSyncKHR")),
            _ => Ok(()),
        }
    }

    pub fn dup_native_fence_fd(&self, sync: &NativeSync) -> Result<OwnedFd> {
        let fns = self.fences()?;
        match unsafe { (fns.eglDupNativeFenceFDANDROID)(self.display.as_ptr(), sync.0) } {
            EGL_NO_NATIVE_FENCE_FD_ANDROID => Err(self.last_error("eglDupNativeFenceFDANDROID")),
            fd => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
        }
    }

    pub fn destroy_sync(&self, sync: NativeSync) -> Result<()> {
        let fns = self.fences()?;
        match unsafe { (fns.eglDestroySyncKHR)(self.display.as_ptr(), sync.0) } {
            egl::FALSE => Err(self.last_error("eglDestroySyncKHR")),
            _ => Ok(()),
        }
    }
}

impl Drop for EglContext {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, None, None, None);
        if let Err(err) = self.egl.destroy_surface(self.display, self.surface) {
            tracing::warn!("failed to destroy egl surface: {err}");
        }
        if let Err(err) = self.egl.destroy_context(self.display, self.context) {
            tracing::warn!("failed to destroy egl context: {err}");
        }
        if let Err(err) = self.egl.terminate(self.display) {
            tracing::warn!("failed to terminate egl display: {err}");
        }
    }
}

/// a window config whose native visual is the scanout format
fn choose_config(egl: &EglInstance, display: egl::Display) -> Result<egl::Config> {
    let attribs = [
        egl::SURFACE_TYPE,
        egl::WINDOW_BIT,
        egl::RED_SIZE,
        1,
        egl::GREEN_SIZE,
        1,
        egl::BLUE_SIZE,
        1,
        egl::ALPHA_SIZE,
        0,
        egl::RENDERABLE_TYPE,
        egl::OPENGL_ES2_BIT,
        egl::NONE,
    ];

    let count = egl.matching_config_count(display, &attribs).map_err(Error::egl)?;
    let mut configs = Vec::with_capacity(count);
    egl.choose_config(display, &attribs, &mut configs).map_err(Error::egl)?;

    configs
        .into_iter()
        .find(|config| {
            egl.get_config_attrib(display, *config, egl::NATIVE_VISUAL_ID)
                .is_ok_and(|id| id as u32 == SCANOUT_FORMAT as u32)
        })
        .ok_or_else(|| Error::Egl(format!("no egl config matching {SCANOUT_FORMAT:?}")))
}

fn has_extensions(advertised: &str, wanted: &[&str]) -> bool {
    wanted
        .iter()
        .all(|ext| advertised.split_ascii_whitespace().any(|e| e == *ext))
}

/// log the gl strings, returns the extension list
fn log_gl_strings() -> String {
    let string = |name| unsafe {
        let ptr = gl::GetString(name);
        match ptr.is_null() {
            true => String::new(),
            false => CStr::from_ptr(ptr.cast()).to_string_lossy().into_owned(),
        }
    };
    tracing::info!("gl {} on {}", string(gl::VERSION), string(gl::RENDERER));
    tracing::debug!("gl vendor \"{}\"", string(gl::VENDOR));
    let extensions = string(gl::EXTENSIONS);
    tracing::debug!("gl extensions \"{extensions}\"");
    extensions
}
