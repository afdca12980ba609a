// Software rasterizer
//
// Vertex transform, primitive assembly, rasterization and fragment shading
// in plain Rust. The compute shaders implement the same stages on the GPU and
// share the uniform and fragment layouts declared here (std430).

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::{DVec2, Mat4, Vec2, Vec3, Vec4};

use crate::mesh::{IndexType, Mesh, Vertex};

/// Threads per compute workgroup along X and Y
pub const TILE_SIZE: u32 = 16;

/// Workgroup counts covering a `width` x `height` target
pub fn dispatch_groups(width: u32, height: u32) -> (u32, u32) {
    (width / TILE_SIZE + 1, height / TILE_SIZE + 1)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ModelUniform {
    pub model: Mat4,
    pub model_inverse_transpose: Mat4,
}

impl ModelUniform {
    pub fn new(model: Mat4) -> Self {
        Self {
            model,
            model_inverse_transpose: model.inverse().transpose(),
        }
    }

    /// Rotation about the Z axis, in radians
    pub fn rotation_z(angle: f32) -> Self {
        Self::new(Mat4::from_rotation_z(angle))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ViewUniform {
    pub view: Mat4,
    pub proj: Mat4,
}

impl ViewUniform {
    /// Camera on +Z looking at the origin; Y spans -1..1, X is scaled by aspect
    pub fn orthographic(aspect: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(Vec3::Z, Vec3::ZERO, Vec3::Y),
            proj: Mat4::orthographic_rh(-aspect, aspect, -1.0, 1.0, 0.1, 10.0),
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj * self.view
    }
}

/// Pixel byte order of the render target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrder {
    Rgba,
    Bgra,
}

impl PixelOrder {
    pub fn from_format(format: ash::vk::Format) -> Self {
        match format {
            ash::vk::Format::B8G8R8A8_UNORM | ash::vk::Format::B8G8R8A8_SRGB => Self::Bgra,
            _ => Self::Rgba,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RasterParams {
    pub clear_color: [f32; 4],
    pub width: u32,
    pub height: u32,
    pub index_count: u32,
    /// Nonzero when the target stores blue first
    pub swizzle_bgra: u32,
}

/// Everything the compute stages read, one copy per frame slot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub model: ModelUniform,
    pub view: ViewUniform,
    pub params: RasterParams,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexOutput {
    pub pos_clip: Vec4,
    pub pos_world: Vec3,
    pub normal_world: Vec3,
    pub col: Vec4,
    pub uv: Vec2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Primitive {
    pub vertices: [VertexOutput; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Fragment {
    pub pos_ndc: [f32; 4],
    pub pos_world: [f32; 4],
    pub normal_world: [f32; 4],
    pub col: [f32; 4],
    pub uv: [f32; 2],
    /// 0 until a primitive covers the pixel
    pub coverage: u32,
    pub _pad: u32,
}

pub fn transform(vertices: &[Vertex], model: &ModelUniform, view: &ViewUniform) -> Vec<VertexOutput> {
    let view_proj = view.view_proj();

    vertices
        .iter()
        .map(|v| {
            let world = model.model * Vec3::from(v.pos).extend(1.0);
            let normal = model.model_inverse_transpose * Vec3::from(v.normal).extend(0.0);
            VertexOutput {
                pos_clip: view_proj * world,
                pos_world: world.truncate(),
                normal_world: normal.truncate().normalize_or_zero(),
                col: Vec4::from(v.color()),
                uv: Vec2::from(v.uv),
            }
        })
        .collect()
}

/// Group transformed vertices into triangles; a trailing partial triangle is ignored
pub fn assemble(outputs: &[VertexOutput], indices: &[IndexType]) -> Result<Vec<Primitive>> {
    indices
        .chunks_exact(3)
        .map(|tri| {
            let fetch = |i: IndexType| {
                outputs.get(i as usize).copied().ok_or_else(|| {
                    anyhow::anyhow!("Index {} out of range for {} vertices", i, outputs.len())
                })
            };
            Ok(Primitive {
                vertices: [fetch(tri[0])?, fetch(tri[1])?, fetch(tri[2])?],
            })
        })
        .collect()
}

/// Evaluated in f64 so huge but finite screen coordinates keep a finite area
fn edge(a: DVec2, b: DVec2, p: DVec2) -> f64 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Top and left edges own the pixels whose centres lie exactly on them
fn is_top_left(a: DVec2, b: DVec2) -> bool {
    (a.y == b.y && b.x > a.x) || b.y < a.y
}

/// NDC to pixel coordinates, Y down
pub fn ndc_to_pixel(ndc: Vec2, width: u32, height: u32) -> Vec2 {
    Vec2::new(
        (ndc.x + 1.0) * 0.5 * width as f32,
        (1.0 - ndc.y) * 0.5 * height as f32,
    )
}

/// Visit every pixel whose centre the triangle covers, with barycentric
/// weights in the order of `points`. Either winding is accepted.
pub fn for_each_covered_pixel(
    points: [Vec2; 3],
    width: u32,
    height: u32,
    mut visit: impl FnMut(u32, u32, [f32; 3]),
) {
    if width == 0 || height == 0 {
        return;
    }

    let [a, mut b, mut c] = points.map(|p| p.as_dvec2());
    let mut area = edge(a, b, c);
    if area == 0.0 || !area.is_finite() {
        return;
    }

    let swapped = area < 0.0;
    if swapped {
        std::mem::swap(&mut b, &mut c);
        area = -area;
    }

    let min = a.min(b).min(c);
    let max = a.max(b).max(c);
    if max.x < 0.0 || max.y < 0.0 || min.x > width as f64 || min.y > height as f64 {
        return;
    }

    let x0 = min.x.floor().max(0.0) as u32;
    let y0 = min.y.floor().max(0.0) as u32;
    let x1 = max.x.ceil().min(width as f64 - 1.0) as u32;
    let y1 = max.y.ceil().min(height as f64 - 1.0) as u32;

    let top_left = [is_top_left(b, c), is_top_left(c, a), is_top_left(a, b)];

    for y in y0..=y1 {
        for x in x0..=x1 {
            let p = DVec2::new(x as f64 + 0.5, y as f64 + 0.5);
            let w = [edge(b, c, p), edge(c, a, p), edge(a, b, p)];

            let inside = w
                .iter()
                .zip(top_left)
                .all(|(&w, owns_edge)| w > 0.0 || (w == 0.0 && owns_edge));
            if !inside {
                continue;
            }

            let bary = w.map(|w| (w / area) as f32);
            if swapped {
                visit(x, y, [bary[0], bary[2], bary[1]]);
            } else {
                visit(x, y, bary);
            }
        }
    }
}

struct ScreenVertex {
    pixel: Vec2,
    depth: f32,
    inv_w: f32,
}

/// Depth is affine in screen space
fn interpolate_depth(screen: &[ScreenVertex; 3], bary: [f32; 3]) -> f32 {
    bary[0] * screen[0].depth + bary[1] * screen[1].depth + bary[2] * screen[2].depth
}

impl Primitive {
    /// Perspective divide and viewport mapping; `None` if a vertex is behind the eye
    fn to_screen(&self, width: u32, height: u32) -> Option<[ScreenVertex; 3]> {
        let project = |v: &VertexOutput| {
            let w = v.pos_clip.w;
            (w > 0.0).then(|| {
                let ndc = v.pos_clip.truncate() / w;
                ScreenVertex {
                    pixel: ndc_to_pixel(ndc.truncate(), width, height),
                    depth: ndc.z,
                    inv_w: 1.0 / w,
                }
            })
        };

        Some([
            project(&self.vertices[0])?,
            project(&self.vertices[1])?,
            project(&self.vertices[2])?,
        ])
    }

    fn fragment(&self, screen: &[ScreenVertex; 3], bary: [f32; 3], pixel: (u32, u32), size: (u32, u32)) -> Fragment {
        let (x, y) = pixel;
        let (width, height) = size;
        let depth = interpolate_depth(screen, bary);

        // Perspective-correct weights for the varyings
        let pw = [
            bary[0] * screen[0].inv_w,
            bary[1] * screen[1].inv_w,
            bary[2] * screen[2].inv_w,
        ];
        let sum = pw[0] + pw[1] + pw[2];
        let pw = pw.map(|w| w / sum);

        let [v0, v1, v2] = self.vertices;
        let mix3 = |a: Vec3, b: Vec3, c: Vec3| a * pw[0] + b * pw[1] + c * pw[2];
        let col = v0.col * pw[0] + v1.col * pw[1] + v2.col * pw[2];
        let uv = v0.uv * pw[0] + v1.uv * pw[1] + v2.uv * pw[2];
        let pos_world = mix3(v0.pos_world, v1.pos_world, v2.pos_world);
        let normal = mix3(v0.normal_world, v1.normal_world, v2.normal_world).normalize_or_zero();

        let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;

        Fragment {
            pos_ndc: [ndc_x, ndc_y, depth, 1.0],
            pos_world: pos_world.extend(1.0).to_array(),
            normal_world: normal.extend(0.0).to_array(),
            col: col.to_array(),
            uv: uv.to_array(),
            coverage: 1,
            _pad: 0,
        }
    }
}

/// Rasterize into a `width * height` fragment buffer with a less-than depth test
pub fn rasterize(primitives: &[Primitive], width: u32, height: u32, fragments: &mut [Fragment]) {
    fragments.fill(Fragment::zeroed());

    for primitive in primitives {
        let Some(screen) = primitive.to_screen(width, height) else {
            continue;
        };
        let points = [screen[0].pixel, screen[1].pixel, screen[2].pixel];

        for_each_covered_pixel(points, width, height, |x, y, bary| {
            let depth = interpolate_depth(&screen, bary);
            if !(0.0..=1.0).contains(&depth) {
                return;
            }

            let Some(slot) = fragments.get_mut((y * width + x) as usize) else {
                return;
            };
            if slot.coverage != 0 && depth >= slot.pos_ndc[2] {
                return;
            }
            *slot = primitive.fragment(&screen, bary, (x, y), (width, height));
        });
    }
}

fn to_unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// Resolve fragments to 8-bit pixels; rows in `out` are `pitch` bytes apart
pub fn shade(
    fragments: &[Fragment],
    width: u32,
    clear_color: [f32; 4],
    order: PixelOrder,
    out: &mut [u8],
    pitch: usize,
) {
    let width = width as usize;
    if width == 0 {
        return;
    }

    for (row, out_row) in fragments.chunks_exact(width).zip(out.chunks_mut(pitch)) {
        for (fragment, pixel) in row.iter().zip(out_row.chunks_exact_mut(4)) {
            let c = if fragment.coverage != 0 {
                fragment.col
            } else {
                clear_color
            };
            let [r, g, b, a] = c.map(to_unorm8);
            let bytes = match order {
                PixelOrder::Rgba => [r, g, b, a],
                PixelOrder::Bgra => [b, g, r, a],
            };
            pixel.copy_from_slice(&bytes);
        }
    }
}

/// The whole pipeline on the CPU, reusing its fragment buffer between frames
#[derive(Default)]
pub struct CpuRasterizer {
    fragments: Vec<Fragment>,
}

impl CpuRasterizer {
    pub fn render(
        &mut self,
        mesh: &Mesh,
        uniforms: &FrameUniforms,
        order: PixelOrder,
        out: &mut [u8],
        pitch: usize,
    ) -> Result<()> {
        let RasterParams { width, height, clear_color, .. } = uniforms.params;
        let pixels = width as usize * height as usize;
        anyhow::ensure!(
            out.len() >= pitch * height as usize && pitch >= width as usize * 4,
            "Target of {} bytes too small for {}x{}",
            out.len(),
            width,
            height
        );

        self.fragments.resize(pixels, Fragment::zeroed());

        let outputs = transform(&mesh.vertices, &uniforms.model, &uniforms.view);
        let primitives = assemble(&outputs, &mesh.indices)?;
        rasterize(&primitives, width, height, &mut self.fragments);
        shade(&self.fragments, width, clear_color, order, out, pitch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    fn flat(pos: [f32; 3], col: [f32; 4]) -> VertexOutput {
        VertexOutput {
            pos_clip: Vec3::from(pos).extend(1.0),
            pos_world: Vec3::from(pos),
            normal_world: Vec3::Z,
            col: Vec4::from(col),
            uv: Vec2::ZERO,
        }
    }

    /// Vertex at `ndc` with the clip-space `w` it was divided by
    fn clip(ndc: [f32; 3], w: f32, col: [f32; 4]) -> VertexOutput {
        VertexOutput {
            pos_clip: Vec3::from(ndc).extend(1.0) * w,
            ..flat(ndc, col)
        }
    }

    fn coverage_counts(points: &[[Vec2; 3]], width: u32, height: u32) -> Vec<u32> {
        let mut counts = vec![0; (width * height) as usize];
        for &tri in points {
            for_each_covered_pixel(tri, width, height, |x, y, _| {
                counts[(y * width + x) as usize] += 1;
            });
        }
        counts
    }

    #[test]
    fn gpu_layouts_match_std430() {
        assert_eq!(size_of::<Fragment>(), 80);
        assert_eq!(size_of::<ModelUniform>(), 128);
        assert_eq!(size_of::<ViewUniform>(), 128);
        assert_eq!(size_of::<RasterParams>(), 32);
        assert_eq!(size_of::<FrameUniforms>(), 288);
    }

    #[test]
    fn dispatch_always_covers_target() {
        assert_eq!(dispatch_groups(1280, 720), (81, 46));
        assert_eq!(dispatch_groups(15, 16), (1, 2));
        let (gx, gy) = dispatch_groups(1000, 333);
        assert!(gx * TILE_SIZE >= 1000 && gy * TILE_SIZE >= 333);
    }

    #[test]
    fn shared_edge_pixels_are_drawn_once() {
        // Quad split along the TL-BR diagonal, pixel centres land on the split
        let (tl, tr, bl, br) = (
            Vec2::new(0.0, 0.0),
            Vec2::new(8.0, 0.0),
            Vec2::new(0.0, 8.0),
            Vec2::new(8.0, 8.0),
        );
        let counts = coverage_counts(&[[tl, br, bl], [tr, br, tl]], 8, 8);
        assert!(counts.iter().all(|&c| c == 1), "{:?}", counts);
    }

    #[test]
    fn winding_does_not_change_coverage() {
        let a = Vec2::new(1.0, 1.0);
        let b = Vec2::new(7.0, 2.0);
        let c = Vec2::new(3.0, 7.0);
        assert_eq!(
            coverage_counts(&[[a, b, c]], 8, 8),
            coverage_counts(&[[a, c, b]], 8, 8)
        );
        assert!(coverage_counts(&[[a, b, c]], 8, 8).iter().any(|&n| n == 1));
    }

    #[test]
    fn barycentrics_follow_input_order() {
        let points = [Vec2::new(0.0, 0.0), Vec2::new(0.0, 8.0), Vec2::new(8.0, 0.0)];
        for_each_covered_pixel(points, 8, 8, |x, y, bary| {
            let p = points[0] * bary[0] + points[1] * bary[1] + points[2] * bary[2];
            assert!((p - Vec2::new(x as f32 + 0.5, y as f32 + 0.5)).length() < 1e-4);
        });
    }

    #[test]
    fn huge_screen_covering_triangle_is_drawn() {
        let tri = [
            Vec2::new(-1e30, -1e30),
            Vec2::new(3e30, -1e30),
            Vec2::new(-1e30, 3e30),
        ];
        assert!(coverage_counts(&[tri], 4, 4).iter().all(|&c| c == 1));
    }

    #[test]
    fn varyings_are_perspective_correct() {
        // Pixel (1, 1) of a 4x4 target has screen weights [0.5, 0.1875, 0.3125]
        let primitive = Primitive {
            vertices: [
                clip([-1.0, -1.0, 0.5], 1.0, [1.0, 0.0, 0.0, 1.0]),
                clip([3.0, -1.0, 0.5], 4.0, [0.0, 1.0, 0.0, 1.0]),
                clip([-1.0, 3.0, 0.5], 1.0, [0.0, 0.0, 1.0, 1.0]),
            ],
        };
        let mut fragments = vec![Fragment::zeroed(); 16];
        rasterize(&[primitive], 4, 4, &mut fragments);

        let fragment = fragments[4 + 1];
        assert_eq!(fragment.coverage, 1);
        assert!((fragment.pos_ndc[2] - 0.5).abs() < 1e-6);

        // Weights scaled by 1/w = [1, 0.25, 1], then renormalised
        let sum = 0.5 + 0.1875 * 0.25 + 0.3125;
        let expected = [0.5 / sum, 0.1875 * 0.25 / sum, 0.3125 / sum, 1.0];
        for (got, want) in fragment.col.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{:?} vs {:?}", fragment.col, expected);
        }
    }

    #[test]
    fn vertex_behind_the_eye_drops_the_triangle() {
        let col = [1.0; 4];
        for w in [0.0, -1.0] {
            let primitive = Primitive {
                vertices: [
                    clip([-1.0, -1.0, 0.5], 1.0, col),
                    clip([3.0, -1.0, 0.5], w, col),
                    clip([-1.0, 3.0, 0.5], 1.0, col),
                ],
            };
            let mut fragments = vec![Fragment::zeroed(); 16];
            rasterize(&[primitive], 4, 4, &mut fragments);
            assert!(fragments.iter().all(|f| f.coverage == 0), "w = {}", w);
        }
    }

    #[test]
    fn degenerate_and_offscreen_triangles_are_skipped() {
        let line = [Vec2::new(0.0, 0.0), Vec2::new(4.0, 4.0), Vec2::new(8.0, 8.0)];
        assert!(coverage_counts(&[line], 8, 8).iter().all(|&c| c == 0));

        let offscreen = [Vec2::new(20.0, 20.0), Vec2::new(30.0, 20.0), Vec2::new(20.0, 30.0)];
        assert!(coverage_counts(&[offscreen], 8, 8).iter().all(|&c| c == 0));
    }

    #[test]
    fn nearer_primitive_wins_regardless_of_order() {
        let red = [1.0, 0.0, 0.0, 1.0];
        let blue = [0.0, 0.0, 1.0, 1.0];
        let tri = |z: f32, col| Primitive {
            vertices: [
                flat([-1.0, -1.0, z], col),
                flat([3.0, -1.0, z], col),
                flat([-1.0, 3.0, z], col),
            ],
        };

        for order in [[tri(0.2, red), tri(0.6, blue)], [tri(0.6, blue), tri(0.2, red)]] {
            let mut fragments = vec![Fragment::zeroed(); 16];
            rasterize(&order, 4, 4, &mut fragments);
            assert!(fragments.iter().all(|f| f.coverage == 1 && f.col == red));
        }
    }

    #[test]
    fn fragments_outside_depth_range_are_clipped() {
        let col = [1.0; 4];
        let primitive = Primitive {
            vertices: [
                flat([-1.0, -1.0, 1.5], col),
                flat([3.0, -1.0, 1.5], col),
                flat([-1.0, 3.0, 1.5], col),
            ],
        };
        let mut fragments = vec![Fragment::zeroed(); 4];
        rasterize(&[primitive], 2, 2, &mut fragments);
        assert!(fragments.iter().all(|f| f.coverage == 0));
    }

    #[test]
    fn assemble_rejects_bad_indices_and_ignores_trailing() {
        let outputs = vec![flat([0.0; 3], [1.0; 4]); 3];
        assert_eq!(assemble(&outputs, &[0, 1, 2, 0]).map(|p| p.len()).ok(), Some(1));
        assert!(assemble(&outputs, &[0, 1, 3]).is_err());
    }

    #[test]
    fn normals_use_inverse_transpose() {
        let model = ModelUniform::new(Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0)));
        let view = ViewUniform::orthographic(1.0);
        let mut vertex = Mesh::triangle().vertices[0];
        vertex.normal = [1.0, 1.0, 0.0];
        let out = transform(&[vertex], &model, &view);
        let expected = Vec3::new(0.5, 1.0, 0.0).normalize();
        assert!((out[0].normal_world - expected).length() < 1e-5);
    }

    #[test]
    fn shade_writes_clear_color_and_swizzles() {
        let mut covered = Fragment::zeroed();
        covered.coverage = 1;
        covered.col = [1.0, 0.5, 0.0, 1.0];
        let fragments = [covered, Fragment::zeroed()];

        let mut rgba = [0u8; 8];
        shade(&fragments, 2, [0.0, 0.0, 1.0, 1.0], PixelOrder::Rgba, &mut rgba, 8);
        assert_eq!(rgba, [255, 128, 0, 255, 0, 0, 255, 255]);

        let mut bgra = [0u8; 8];
        shade(&fragments, 2, [0.0, 0.0, 1.0, 1.0], PixelOrder::Bgra, &mut bgra, 8);
        assert_eq!(bgra, [0, 128, 255, 255, 255, 0, 0, 255]);
    }

    #[test]
    fn cpu_render_draws_triangle_centre_in_vertex_colors() {
        let mesh = Mesh::triangle();
        let uniforms = FrameUniforms {
            model: ModelUniform::rotation_z(0.0),
            view: ViewUniform::orthographic(1.0),
            params: RasterParams {
                clear_color: [0.0, 0.0, 0.0, 1.0],
                width: 64,
                height: 64,
                index_count: 3,
                swizzle_bgra: 0,
            },
        };

        let mut out = vec![0u8; 64 * 64 * 4];
        CpuRasterizer::default()
            .render(&mesh, &uniforms, PixelOrder::Rgba, &mut out, 64 * 4)
            .map_err(|e| e.to_string())
            .unwrap();

        let pixel = |x: usize, y: usize| &out[(y * 64 + x) * 4..(y * 64 + x) * 4 + 4];
        // Centre is covered and blends all three vertex colours
        let centre = pixel(32, 32);
        assert_ne!(centre, [0, 0, 0, 255]);
        assert_eq!(centre[3], 255);
        // Corners stay clear
        assert_eq!(pixel(0, 0), [0, 0, 0, 255]);
        assert_eq!(pixel(63, 63), [0, 0, 0, 255]);
    }
}
