//! Demo viewer
//!
//! A field of spinning cubes over a ground plane, rendered through the full
//! culling and indirect draw path. Orbit with WASD, zoom with Q/E, quit with
//! Escape.
//!
//! Usage: `viewer [--deferred] [--rt-shadows] [--cpu-culling] [config.toml|config.ron]`

use std::time::Instant;

use glfw::{Action, Key, WindowEvent};

use framegraph_engine::config::Config;
use framegraph_engine::foundation::logging;
use framegraph_engine::foundation::math::{Mat4, Vec3};
use framegraph_engine::prelude::*;
use framegraph_engine::render::backends::vulkan::Window;

const GRID: i32 = 12;
const SPACING: f32 = 3.0;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

unsafe impl bytemuck::Pod for Vertex {}
unsafe impl bytemuck::Zeroable for Vertex {}

fn cube() -> (Vec<Vertex>, Vec<u32>) {
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = vertices.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = [
                0.5 * (normal[0] + su * u[0] + sv * v[0]),
                0.5 * (normal[1] + su * u[1] + sv * v[1]),
                0.5 * (normal[2] + su * u[2] + sv * v[2]),
            ];
            vertices.push(Vertex { position, normal, uv: [(su + 1.0) * 0.5, (sv + 1.0) * 0.5] });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

fn ground() -> (Vec<Vertex>, Vec<u32>) {
    let normal = [0.0, 1.0, 0.0];
    let vertices = [(-1.0, -1.0), (-1.0, 1.0), (1.0, 1.0), (1.0, -1.0)]
        .map(|(x, z)| Vertex { position: [x, 0.0, z], normal, uv: [(x + 1.0) * 0.5, (z + 1.0) * 0.5] })
        .to_vec();
    (vertices, vec![0, 1, 2, 0, 2, 3])
}

/// Orbit camera driven by key state
struct OrbitController {
    yaw: f32,
    pitch: f32,
    distance: f32,
    held: [bool; 6],
}

impl OrbitController {
    const KEYS: [Key; 6] = [Key::A, Key::D, Key::W, Key::S, Key::Q, Key::E];

    fn new() -> Self {
        Self { yaw: 0.6, pitch: 0.5, distance: 40.0, held: [false; 6] }
    }

    fn handle_event(&mut self, event: &WindowEvent) {
        if let WindowEvent::Key(key, _, action, _) = event {
            if let Some(i) = Self::KEYS.iter().position(|k| k == key) {
                self.held[i] = *action != Action::Release;
            }
        }
    }

    fn update(&mut self, dt: f32) {
        let axis = |neg: bool, pos: bool| f32::from(u8::from(pos)) - f32::from(u8::from(neg));
        self.yaw += axis(self.held[0], self.held[1]) * dt * 1.5;
        self.pitch = (self.pitch + axis(self.held[3], self.held[2]) * dt).clamp(0.05, 1.5);
        self.distance = (self.distance + axis(self.held[4], self.held[5]) * dt * 20.0).clamp(5.0, 150.0);
    }

    fn camera(&self, aspect: f32) -> CameraData {
        let eye = Vec3::new(
            self.distance * self.pitch.cos() * self.yaw.sin(),
            self.distance * self.pitch.sin(),
            self.distance * self.pitch.cos() * self.yaw.cos(),
        );
        CameraData::look_at(eye, Vec3::zeros(), 0.9, aspect, 0.1, 500.0)
    }
}

struct ViewerApp {
    window: Window,
    renderer: VulkanRenderer,
    controller: OrbitController,
    cube: MeshId,
    ground: MeshId,
    start: Instant,
}

impl ViewerApp {
    fn new(config: RendererConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let window = Window::new("framegraph viewer", 1280, 720)?;
        let mut renderer = VulkanRenderer::new(&window, config, VertexLayout::position_normal_uv())?;
        log::info!("Active features: {:?}", renderer.features());

        let (vertices, indices) = cube();
        let cube = renderer.mesh_bank_mut().add_mesh(&vertices, &indices, MeshDescriptor::new("cube"))?;
        let (vertices, indices) = ground();
        let ground = renderer.mesh_bank_mut().add_mesh(&vertices, &indices, MeshDescriptor::new("ground"))?;
        renderer.build_mesh_buffers()?;

        let mut app = Self {
            window,
            renderer,
            controller: OrbitController::new(),
            cube,
            ground,
            start: Instant::now(),
        };
        let scene = app.scene(0.0);
        app.renderer.update_draw_instance_counts(&scene.mesh_instance_counts())?;
        Ok(app)
    }

    fn scene(&self, time: f32) -> StaticScene {
        let mut scene = StaticScene::new();
        let extent = Vec3::new(GRID as f32 * SPACING, 1.0, GRID as f32 * SPACING);
        let ground = Mat4::new_translation(&Vec3::new(0.0, -1.0, 0.0)) * Mat4::new_nonuniform_scaling(&extent);
        scene.add_renderable(RenderableInstance::new(self.ground, ground).with_scale(extent).with_material(1));

        for x in -GRID / 2..GRID / 2 {
            for z in -GRID / 2..GRID / 2 {
                let offset = Vec3::new(x as f32 * SPACING, 0.0, z as f32 * SPACING);
                let spin = time + (x * 7 + z * 13) as f32 * 0.1;
                let model = Mat4::new_translation(&offset) * Mat4::from_euler_angles(0.0, spin, 0.0);
                let material = ((x + GRID) * 31 + z + GRID) as u32;
                scene.add_renderable(RenderableInstance::new(self.cube, model).with_material(material));
            }
        }

        scene.add_light(DirectionalLight::new(Vec3::new(-0.4, -1.0, -0.3), Vec3::new(1.0, 0.95, 0.9)));
        let extent = self.renderer.extent();
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        scene.add_camera(self.controller.camera(aspect));
        scene
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut last = Instant::now();
        while !self.window.should_close() {
            self.window.poll_events();
            for event in self.window.drain_events() {
                match event {
                    WindowEvent::Key(Key::Escape, _, Action::Press, _) => self.window.set_should_close(true),
                    WindowEvent::FramebufferSize(w, h) => {
                        self.renderer.notify_framebuffer_resized(w.max(0) as u32, h.max(0) as u32);
                    }
                    ref other => self.controller.handle_event(other),
                }
            }

            let now = Instant::now();
            self.controller.update((now - last).as_secs_f32());
            last = now;

            let scene = self.scene(self.start.elapsed().as_secs_f32());
            if let FrameStatus::Skipped(reason) = self.renderer.draw_frame(&scene)? {
                log::debug!("Frame skipped: {:?}", reason);
            }
            if self.renderer.frame_number() % 300 == 0 {
                if let Some(stats) = self.renderer.last_cull_stats() {
                    log::info!("CPU cull: {} of {} visible", stats.visible, stats.tested);
                }
            }
        }
        self.renderer.wait_idle()?;
        Ok(())
    }
}

fn load_config() -> Result<RendererConfig, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = match args.iter().find(|a| a.ends_with(".toml") || a.ends_with(".ron")) {
        Some(path) => RendererConfig::load_from_file(path)?,
        None => RendererConfig::new("framegraph viewer"),
    };
    config.shaders = ShaderConfig::with_path_resolution();

    for arg in &args {
        match arg.as_str() {
            "--deferred" => config.pipeline = PipelineMode::Deferred,
            "--rt-shadows" => {
                config.pipeline = PipelineMode::Deferred;
                config.ray_traced_shadows = true;
            }
            "--cpu-culling" => config.culling.gpu = false,
            _ => {}
        }
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_with_level(log::LevelFilter::Info);

    let config = load_config()?;
    let mut app = ViewerApp::new(config)?;
    app.run()
}
