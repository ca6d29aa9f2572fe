use std::ffi::{CStr, CString};

use gl::types::{GLchar, GLenum, GLint, GLsizeiptr, GLuint};

use crate::{
    gpu::{DmaBufImage, ImageImporter, TEXTURE_EXTERNAL_OES},
    render::{transform::Mat4, video::FrameSource, Renderer},
    Error, Result,
};

const VERTEX_SHADER: &str = r#"
uniform mat4 modelviewMatrix;
uniform mat4 modelviewprojectionMatrix;
uniform mat3 normalMatrix;

attribute vec4 in_position;
attribute vec3 in_normal;
attribute vec4 in_color;
attribute vec2 in_texcoord;

vec4 lightSource = vec4(2.0, 2.0, 20.0, 0.0);

varying vec4 vVaryingColor;
varying vec2 vTexCoord;

void main()
{
    gl_Position = modelviewprojectionMatrix * in_position;
    vec3 vEyeNormal = normalMatrix * in_normal;
    vec4 vPosition4 = modelviewMatrix * in_position;
    vec3 vPosition3 = vPosition4.xyz / vPosition4.w;
    vec3 vLightDir = normalize(lightSource.xyz - vPosition3);
    float diff = max(0.0, dot(vEyeNormal, vLightDir));
    vVaryingColor = vec4(diff * in_color.rgb, 1.0);
    vTexCoord = in_texcoord;
}
"#;

const SMOOTH_FRAGMENT_SHADER: &str = r#"
precision mediump float;

varying vec4 vVaryingColor;

void main()
{
    gl_FragColor = vVaryingColor;
}
"#;

const EXTERNAL_FRAGMENT_SHADER: &str = r#"
#extension GL_OES_EGL_image_external : enable
precision mediump float;

uniform samplerExternalOES uTex;

varying vec4 vVaryingColor;
varying vec2 vTexCoord;

void main()
{
    gl_FragColor = vVaryingColor * texture2D(uTex, vTexCoord);
}
"#;

/// luma and chroma sampled separately, bt.601 full range conversion
const NV12_FRAGMENT_SHADER: &str = r#"
#extension GL_OES_EGL_image_external : enable
precision mediump float;

uniform samplerExternalOES uTexY;
uniform samplerExternalOES uTexUV;

varying vec4 vVaryingColor;
varying vec2 vTexCoord;

const mat4 csc = mat4(1.0,  0.0,    1.402, -0.701,
                      1.0, -0.344, -0.714,  0.529,
                      1.0,  1.772,  0.0,   -0.886,
                      0.0,  0.0,    0.0,    0.0);

void main()
{
    vec4 yuv;
    yuv.x = texture2D(uTexY, vTexCoord).x;
    yuv.yz = texture2D(uTexUV, vTexCoord).xy;
    yuv.w = 1.0;
    gl_FragColor = vVaryingColor * (yuv * csc);
}
"#;

const FACES: usize = 6;
const VERTICES: usize = FACES * 4;

#[rustfmt::skip]
const POSITIONS: [f32; VERTICES * 3] = [
    // front
    -1.0, -1.0,  1.0,   1.0, -1.0,  1.0,  -1.0,  1.0,  1.0,   1.0,  1.0,  1.0,
    // back
     1.0, -1.0, -1.0,  -1.0, -1.0, -1.0,   1.0,  1.0, -1.0,  -1.0,  1.0, -1.0,
    // right
     1.0, -1.0,  1.0,   1.0, -1.0, -1.0,   1.0,  1.0,  1.0,   1.0,  1.0, -1.0,
    // left
    -1.0, -1.0, -1.0,  -1.0, -1.0,  1.0,  -1.0,  1.0, -1.0,  -1.0,  1.0,  1.0,
    // top
    -1.0,  1.0,  1.0,   1.0,  1.0,  1.0,  -1.0,  1.0, -1.0,   1.0,  1.0, -1.0,
    // bottom
    -1.0, -1.0, -1.0,   1.0, -1.0, -1.0,  -1.0, -1.0,  1.0,   1.0, -1.0,  1.0,
];

#[rustfmt::skip]
const NORMALS: [[f32; 3]; FACES] = [
    [0.0, 0.0, 1.0],
    [0.0, 0.0, -1.0],
    [1.0, 0.0, 0.0],
    [-1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, -1.0, 0.0],
];

#[rustfmt::skip]
const FACE_TEXCOORDS: [f32; 8] = [1.0, 1.0,  0.0, 1.0,  1.0, 0.0,  0.0, 0.0];
#[rustfmt::skip]
const BOTTOM_TEXCOORDS: [f32; 8] = [1.0, 0.0,  0.0, 0.0,  1.0, 1.0,  0.0, 1.0];

const ATTR_POSITION: GLuint = 0;
const ATTR_NORMAL: GLuint = 1;
const ATTR_COLOR: GLuint = 2;
const ATTR_TEXCOORD: GLuint = 3;

/// interleaved-by-block vertex data: positions, normals, colors, texcoords
fn vertex_data() -> Vec<f32> {
    let mut data = Vec::with_capacity(VERTICES * 11);
    data.extend_from_slice(&POSITIONS);
    for normal in NORMALS {
        for _ in 0..4 {
            data.extend_from_slice(&normal);
        }
    }
    // vertex color is the position mapped into the unit cube
    data.extend(POSITIONS.iter().map(|p| (p + 1.0) / 2.0));
    for face in 0..FACES {
        match face {
            5 => data.extend_from_slice(&BOTTOM_TEXCOORDS),
            _ => data.extend_from_slice(&FACE_TEXCOORDS),
        }
    }
    data
}

const LIGHT: [u8; 3] = [0xf0, 0xc0, 0x40];
const DARK: [u8; 3] = [0x20, 0x40, 0xa0];

fn light_cell(x: u32, y: u32, square: u32) -> bool {
    ((x / square) + (y / square)) % 2 == 0
}

/// `size`x`size` rgba checkerboard with `square` pixel cells
pub fn checkerboard(size: u32, square: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(size as usize * size as usize * 4);
    for y in 0..size {
        for x in 0..size {
            let [r, g, b] = if light_cell(x, y, square) { LIGHT } else { DARK };
            pixels.extend_from_slice(&[r, g, b, 0xff]);
        }
    }
    pixels
}

/// full range bt.601
fn yuv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = 128.0 + 0.564 * (b - y);
    let v = 128.0 + 0.713 * (r - y);
    [y, u, v].map(|c| c.round().clamp(0.0, 255.0) as u8)
}

/// the [`checkerboard`] as nv12: a full size luma plane and a half size
/// plane of interleaved u and v
pub fn nv12_checkerboard(size: u32, square: u32) -> (Vec<u8>, Vec<u8>) {
    let (light, dark) = (yuv(LIGHT), yuv(DARK));
    let color = |x, y| if light_cell(x, y, square) { light } else { dark };

    let mut luma = Vec::with_capacity(size as usize * size as usize);
    for y in 0..size {
        luma.extend((0..size).map(|x| color(x, y)[0]));
    }

    let half = size / 2;
    let mut chroma = Vec::with_capacity(half as usize * half as usize * 2);
    for y in 0..half {
        for x in 0..half {
            let [_, u, v] = color(x * 2, y * 2);
            chroma.extend_from_slice(&[u, v]);
        }
    }
    (luma, chroma)
}

/// what the cube faces show
pub enum CubeContent {
    Smooth,
    /// one image on a single external texture, the driver converts yuv formats
    Image(DmaBufImage),
    /// nv12 as separate luma and chroma images, converted in the shader
    Nv12Planes { luma: DmaBufImage, chroma: DmaBufImage },
    Video(Box<dyn FrameSource>),
}

impl CubeContent {
    fn fragment_shader(&self) -> &'static str {
        match self {
            CubeContent::Smooth => SMOOTH_FRAGMENT_SHADER,
            CubeContent::Nv12Planes { .. } => NV12_FRAGMENT_SHADER,
            CubeContent::Image(_) | CubeContent::Video(_) => EXTERNAL_FRAGMENT_SHADER,
        }
    }

    /// sampler uniforms, one texture unit each in order
    fn samplers(&self) -> &'static [&'static CStr] {
        match self {
            CubeContent::Smooth => &[],
            CubeContent::Nv12Planes { .. } => &[c"uTexY", c"uTexUV"],
            CubeContent::Image(_) | CubeContent::Video(_) => &[c"uTex"],
        }
    }
}

/// rotating, lit cube
pub struct CubeRenderer {
    program: GLuint,
    vbo: GLuint,
    /// external textures, bound to the units of their index
    textures: Vec<GLuint>,
    modelview: GLint,
    modelviewprojection: GLint,
    normal: GLint,
    aspect: f32,
    video: Option<(Box<dyn FrameSource>, ImageImporter)>,
}

impl CubeRenderer {
    /// needs a current gl context, and `importer` for every content but
    /// [`CubeContent::Smooth`]
    pub fn new(size: (u32, u32), content: CubeContent, importer: Option<ImageImporter>) -> Result<Self> {
        let program = link_program(VERTEX_SHADER, content.fragment_shader())?;
        let uniform = |name: &CStr| unsafe { gl::GetUniformLocation(program, name.as_ptr()) };

        let data = vertex_data();
        let float = std::mem::size_of::<f32>();
        let mut vbo = 0;
        unsafe {
            gl::UseProgram(program);
            gl::Viewport(0, 0, size.0 as i32, size.1 as i32);
            gl::Enable(gl::CULL_FACE);

            gl::GenBuffers(1, &mut vbo);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                (data.len() * float) as GLsizeiptr,
                data.as_ptr().cast(),
                gl::STATIC_DRAW,
            );

            let blocks = [
                (ATTR_POSITION, 3, 0),
                (ATTR_NORMAL, 3, VERTICES * 3),
                (ATTR_COLOR, 3, VERTICES * 6),
                (ATTR_TEXCOORD, 2, VERTICES * 9),
            ];
            for (attr, components, offset) in blocks {
                gl::VertexAttribPointer(attr, components, gl::FLOAT, gl::FALSE, 0, (offset * float) as *const _);
                gl::EnableVertexAttribArray(attr);
            }
            if !matches!(content, CubeContent::Smooth) {
                // textured faces are lit white
                gl::DisableVertexAttribArray(ATTR_COLOR);
                gl::VertexAttrib4f(ATTR_COLOR, 1.0, 1.0, 1.0, 1.0);
            }
        }

        let samplers = content.samplers();
        let mut textures = vec![0; samplers.len()];
        unsafe {
            if !textures.is_empty() {
                gl::GenTextures(textures.len() as i32, textures.as_mut_ptr());
            }
            for (unit, sampler) in samplers.iter().copied().enumerate() {
                gl::Uniform1i(uniform(sampler), unit as GLint);
            }
        }

        let mut renderer = Self {
            program,
            vbo,
            textures,
            modelview: uniform(c"modelviewMatrix"),
            modelviewprojection: uniform(c"modelviewprojectionMatrix"),
            normal: uniform(c"normalMatrix"),
            aspect: size.1 as f32 / size.0 as f32,
            video: None,
        };

        let importer = || importer.ok_or_else(|| Error::MissingCapability("dma-buf image import".into()));
        match content {
            CubeContent::Smooth => {}
            CubeContent::Image(image) => {
                renderer.import(&importer()?, 0, &image)?;
            }
            CubeContent::Nv12Planes { luma, chroma } => {
                let importer = importer()?;
                renderer.import(&importer, 0, &luma)?;
                renderer.import(&importer, 1, &chroma)?;
            }
            CubeContent::Video(source) => {
                renderer.video = Some((source, importer()?));
            }
        }

        check_error("cube setup")?;
        Ok(renderer)
    }

    fn import(&self, importer: &ImageImporter, unit: usize, image: &DmaBufImage) -> Result<()> {
        unsafe { gl::ActiveTexture(gl::TEXTURE0 + unit as GLenum) };
        importer.import(image, self.textures[unit])
    }

    fn next_video_frame(&mut self) -> Result<()> {
        let Some((source, importer)) = self.video.as_mut() else {
            return Ok(());
        };

        let image = match source.next_frame()? {
            Some(image) => Some(image),
            None => {
                source.restart()?;
                source.next_frame()?
            }
        };
        // a source still empty after a restart keeps showing the last frame
        if let Some(image) = image {
            unsafe { gl::ActiveTexture(gl::TEXTURE0) };
            importer.import(&image, self.textures[0])?;
        }
        Ok(())
    }
}

impl Renderer for CubeRenderer {
    fn draw(&mut self, frame: u64) -> Result<()> {
        self.next_video_frame()?;

        let i = frame as f32;
        let modelview = Mat4::IDENTITY
            .translate(0.0, 0.0, -8.0)
            .rotate(45.0 + 0.25 * i, 1.0, 0.0, 0.0)
            .rotate(45.0 - 0.5 * i, 0.0, 1.0, 0.0)
            .rotate(10.0 + 0.15 * i, 0.0, 0.0, 1.0);
        let projection = Mat4::frustum(-2.8, 2.8, -2.8 * self.aspect, 2.8 * self.aspect, 6.0, 10.0);
        let modelviewprojection = projection * modelview;
        let normal = modelview.normal_matrix();

        unsafe {
            gl::ClearColor(0.5, 0.5, 0.5, 1.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);

            gl::UniformMatrix4fv(self.modelview, 1, gl::FALSE, modelview.as_ptr());
            gl::UniformMatrix4fv(self.modelviewprojection, 1, gl::FALSE, modelviewprojection.as_ptr());
            gl::UniformMatrix3fv(self.normal, 1, gl::FALSE, normal.as_ptr());

            for (unit, texture) in self.textures.iter().enumerate() {
                gl::ActiveTexture(gl::TEXTURE0 + unit as GLenum);
                gl::BindTexture(TEXTURE_EXTERNAL_OES, *texture);
            }

            for face in 0..FACES as i32 {
                gl::DrawArrays(gl::TRIANGLE_STRIP, face * 4, 4);
            }
        }

        check_error("draw")
    }
}

impl Drop for CubeRenderer {
    fn drop(&mut self) {
        unsafe {
            if !self.textures.is_empty() {
                gl::DeleteTextures(self.textures.len() as i32, self.textures.as_ptr());
            }
            gl::DeleteBuffers(1, &self.vbo);
            gl::DeleteProgram(self.program);
        }
    }
}

fn compile_shader(kind: GLenum, source: &str) -> Result<GLuint> {
    let source = CString::new(source).map_err(|err| Error::Render(err.to_string()))?;
    unsafe {
        let shader = gl::CreateShader(kind);
        gl::ShaderSource(shader, 1, &source.as_ptr(), std::ptr::null());
        gl::CompileShader(shader);

        let mut status = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status);
        if status == 0 {
            let mut len = 0;
            gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
            let mut log = vec![0u8; len.max(1) as usize];
            gl::GetShaderInfoLog(shader, len, std::ptr::null_mut(), log.as_mut_ptr() as *mut GLchar);
            gl::DeleteShader(shader);
            let stage = if kind == gl::VERTEX_SHADER { "vertex" } else { "fragment" };
            return Err(Error::Render(format!(
                "{stage} shader compilation failed: {}",
                String::from_utf8_lossy(&log).trim_end_matches('\0')
            )));
        }
        Ok(shader)
    }
}

fn link_program(vertex: &str, fragment: &str) -> Result<GLuint> {
    let vertex = compile_shader(gl::VERTEX_SHADER, vertex)?;
    let fragment = match compile_shader(gl::FRAGMENT_SHADER, fragment) {
        Ok(shader) => shader,
        Err(err) => {
            unsafe { gl::DeleteShader(vertex) };
            return Err(err);
        }
    };

    unsafe {
        let program = gl::CreateProgram();
        gl::AttachShader(program, vertex);
        gl::AttachShader(program, fragment);

        let attributes = [
            (ATTR_POSITION, c"in_position"),
            (ATTR_NORMAL, c"in_normal"),
            (ATTR_COLOR, c"in_color"),
            (ATTR_TEXCOORD, c"in_texcoord"),
        ];
        for (index, name) in attributes {
            gl::BindAttribLocation(program, index, name.as_ptr());
        }
        gl::LinkProgram(program);
        gl::DeleteShader(vertex);
        gl::DeleteShader(fragment);

        let mut status = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut status);
        if status == 0 {
            let mut len = 0;
            gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
            let mut log = vec![0u8; len.max(1) as usize];
            gl::GetProgramInfoLog(program, len, std::ptr::null_mut(), log.as_mut_ptr() as *mut GLchar);
            gl::DeleteProgram(program);
            return Err(Error::Render(format!(
                "program linking failed: {}",
                String::from_utf8_lossy(&log).trim_end_matches('\0')
            )));
        }
        Ok(program)
    }
}

fn check_error(stage: &str) -> Result<()> {
    match unsafe { gl::GetError() } {
        gl::NO_ERROR => Ok(()),
        code => Err(Error::Render(format!("{stage}: gl error {code:#x}"))),
    }
}
