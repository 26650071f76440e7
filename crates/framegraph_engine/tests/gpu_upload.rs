//! Device-backed checks; run with `cargo test --features window -- --ignored`
//!
//! Each test skips itself when no window or Vulkan device is available.

#![cfg(feature = "window")]

use framegraph_engine::foundation::math::{Mat4, Vec3};
use framegraph_engine::prelude::*;
use framegraph_engine::render::backends::vulkan::Window;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

unsafe impl bytemuck::Pod for Vertex {}
unsafe impl bytemuck::Zeroable for Vertex {}

fn triangle() -> (Vec<Vertex>, Vec<u32>) {
    let normal = [0.0, 0.0, 1.0];
    let vertices = vec![
        Vertex { position: [-0.5, -0.5, 0.0], normal, uv: [0.0, 0.0] },
        Vertex { position: [0.5, -0.5, 0.0], normal, uv: [1.0, 0.0] },
        Vertex { position: [0.0, 0.5, 0.0], normal, uv: [0.5, 1.0] },
    ];
    (vertices, vec![0, 1, 2])
}

fn renderer(config: RendererConfig) -> Option<(Window, VulkanRenderer)> {
    let window = match Window::new("gpu test", 320, 240) {
        Ok(window) => window,
        Err(e) => {
            eprintln!("skipping: no window ({e})");
            return None;
        }
    };
    match VulkanRenderer::new(&window, config.with_shaders(ShaderConfig::with_path_resolution()), VertexLayout::position_normal_uv()) {
        Ok(renderer) => Some((window, renderer)),
        Err(e) => {
            eprintln!("skipping: no Vulkan device ({e})");
            None
        }
    }
}

fn scene(mesh: MeshId, positions: &[Vec3]) -> StaticScene {
    let mut scene = StaticScene::new();
    for p in positions {
        scene.add_renderable(RenderableInstance::new(mesh, Mat4::new_translation(p)));
    }
    scene.add_light(DirectionalLight::new(Vec3::new(0.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0)));
    scene.add_camera(CameraData::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros(), 1.0, 4.0 / 3.0, 0.1, 100.0));
    scene
}

#[test]
#[ignore]
fn test_cpu_culled_upload_draws_visible_objects() {
    let culling = CullingConfig { gpu: false, frustum: true, occlusion: false };
    let Some((_window, mut renderer)) = renderer(RendererConfig::new("gpu test").with_culling(culling)) else {
        return;
    };

    let (vertices, indices) = triangle();
    let mesh = renderer
        .mesh_bank_mut()
        .add_mesh(&vertices, &indices, MeshDescriptor::new("triangle"))
        .expect("add mesh");
    renderer.build_mesh_buffers().expect("upload");

    // One object in view, one far behind the camera
    let scene = scene(mesh, &[Vec3::zeros(), Vec3::new(0.0, 0.0, 50.0)]);
    renderer.update_draw_instance_counts(&scene.mesh_instance_counts()).expect("reserve");

    let mut rendered = 0;
    for _ in 0..4 {
        if renderer.draw_frame(&scene).expect("frame") == FrameStatus::Rendered {
            rendered += 1;
        }
    }
    renderer.wait_idle().expect("idle");

    assert!(rendered > 0);
    let stats = renderer.last_cull_stats().expect("cpu culling ran");
    assert_eq!(stats.tested, 2);
    assert_eq!(stats.visible, 1);
    assert_eq!(stats.dropped, 0);
}

#[test]
#[ignore]
fn test_gpu_culling_frames_complete() {
    let Some((_window, mut renderer)) = renderer(RendererConfig::new("gpu test").with_pipeline(PipelineMode::Deferred)) else {
        return;
    };

    let (vertices, indices) = triangle();
    let mesh = renderer
        .mesh_bank_mut()
        .add_mesh(&vertices, &indices, MeshDescriptor::new("triangle"))
        .expect("add mesh");
    renderer.build_mesh_buffers().expect("upload");

    let scene = scene(mesh, &[Vec3::zeros(), Vec3::new(1.0, 0.0, 0.0)]);
    renderer.update_draw_instance_counts(&scene.mesh_instance_counts()).expect("reserve");
    for _ in 0..6 {
        renderer.draw_frame(&scene).expect("frame");
    }
    renderer.wait_idle().expect("idle");
    assert!(renderer.frame_number() >= 1);
}

#[test]
#[ignore]
fn test_growing_population_without_update_is_rejected() {
    let Some((_window, mut renderer)) = renderer(RendererConfig::new("gpu test")) else {
        return;
    };

    let (vertices, indices) = triangle();
    let mesh = renderer
        .mesh_bank_mut()
        .add_mesh(&vertices, &indices, MeshDescriptor::new("triangle"))
        .expect("add mesh");
    renderer.build_mesh_buffers().expect("upload");

    let small = scene(mesh, &[Vec3::zeros()]);
    renderer.update_draw_instance_counts(&small.mesh_instance_counts()).expect("reserve");

    let large = scene(mesh, &[Vec3::zeros(), Vec3::new(1.0, 0.0, 0.0)]);
    let err = renderer.draw_frame(&large).expect_err("population outgrew reservation");
    assert!(matches!(err, RenderError::InstanceCountsOutOfDate { .. }));
}

#[test]
#[ignore]
fn test_staged_upload_round_trips_through_readback() {
    use ash::vk;
    use framegraph_engine::render::backends::vulkan::resources::{QueueType, ResourceAllocator};
    use framegraph_engine::render::backends::vulkan::VulkanContext;
    use gpu_allocator::MemoryLocation;

    let window = match Window::new("gpu test", 64, 64) {
        Ok(window) => window,
        Err(e) => {
            eprintln!("skipping: no window ({e})");
            return;
        }
    };
    let context = match VulkanContext::new(&window, "upload test", (0, 1, 0), false, false) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("skipping: no Vulkan device ({e})");
            return;
        }
    };
    let mut allocator = ResourceAllocator::new(&context).unwrap();

    let payload: Vec<u8> = (0..1024u32).flat_map(|i| (i * 7).to_le_bytes()).collect();
    let device_local = allocator
        .create_and_map_buffer(&payload, vk::BufferUsageFlags::TRANSFER_SRC, "upload source")
        .unwrap();
    let readback = allocator.create_buffer(
        payload.len() as u64,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
        "readback",
    );

    let (src, dst) = (allocator.buffer_handle(device_local), allocator.buffer_handle(readback));
    allocator
        .immediate_submit(QueueType::Graphics, |device, cmd| unsafe {
            let region = vk::BufferCopy::builder().size(payload.len() as u64).build();
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
        })
        .unwrap();

    assert_eq!(allocator.mapped_bytes(readback).unwrap(), payload.as_slice());

    allocator.destroy_buffer(device_local);
    allocator.destroy_buffer(device_local);
    assert_eq!(allocator.buffer_count(), 1);
    drop(allocator);
}
