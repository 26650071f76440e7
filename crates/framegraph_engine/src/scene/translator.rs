//! Scene to GPU buffer translation
//!
//! Validates a [`SceneSource`] snapshot against the mesh bank, packs it into
//! [`ObjectData`], [`SceneUniforms`] and [`LightData`], and hands the result
//! to a [`SceneDataSink`]. Validation happens before the first write, so a
//! rejected frame leaves the sink untouched.

use thiserror::Error;

use crate::foundation::math::{mat4_to_cols, Vec3};
use crate::render::draw_commands::MeshInstanceCounts;
use crate::render::gpu_types::{LightData, ObjectData, SceneUniforms};
use crate::render::mesh_bank::{MeshBank, MeshId};
use crate::scene::source::{CameraData, SceneSource};

/// Frame-skipping translation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// Nothing to render from
    #[error("Scene has no camera")]
    NoCamera,

    /// Nothing to light with
    #[error("Scene has no directional light")]
    NoLight,

    /// A renderable names a mesh the bank does not have
    #[error("Renderable {index} references unknown mesh {mesh:?}")]
    UnknownMesh {
        /// Position in the renderable list
        index: usize,
        /// The missing mesh
        mesh: MeshId,
    },
}

/// Destination for translated frame data
pub trait SceneDataSink {
    /// Per-object records, one per renderable
    fn write_objects(&mut self, objects: &[ObjectData]);

    /// Camera block
    fn write_scene(&mut self, scene: &SceneUniforms);

    /// Directional lights
    fn write_lights(&mut self, lights: &[LightData]);
}

/// What the renderer needs after translation
#[derive(Debug, Clone)]
pub struct TranslatedFrame {
    /// Camera used for this frame
    pub camera: CameraData,
    /// Objects written
    pub object_count: u32,
    /// Lights written
    pub light_count: u32,
    /// Population per mesh
    pub instance_counts: MeshInstanceCounts,
}

/// Packed buffer contents for one frame
#[derive(Debug, Clone)]
pub struct TranslatedData {
    /// Summary for the renderer
    pub frame: TranslatedFrame,
    /// Object records
    pub objects: Vec<ObjectData>,
    /// Camera block
    pub uniforms: SceneUniforms,
    /// Light records
    pub lights: Vec<LightData>,
}

/// Packs scene snapshots for a fixed mesh bank
pub struct SceneTranslator<'a> {
    bank: &'a MeshBank,
    shadows_enabled: bool,
}

impl<'a> SceneTranslator<'a> {
    /// Translator for meshes in `bank`
    pub fn new(bank: &'a MeshBank) -> Self {
        Self { bank, shadows_enabled: false }
    }

    /// Mark the shadow mask as valid in the scene uniforms
    pub fn with_shadows(mut self, enabled: bool) -> Self {
        self.shadows_enabled = enabled;
        self
    }

    /// Pack without writing anywhere
    pub fn translate(&self, scene: &dyn SceneSource) -> Result<TranslatedData, TranslateError> {
        let camera = scene.cameras().into_iter().next().ok_or(TranslateError::NoCamera)?;
        let lights = scene.directional_lights();
        if lights.is_empty() {
            return Err(TranslateError::NoLight);
        }

        let renderables = scene.renderables();
        let mut objects = Vec::with_capacity(renderables.len());
        let mut instance_counts = MeshInstanceCounts::new();
        for (index, renderable) in renderables.iter().enumerate() {
            let mesh = self.bank.mesh(renderable.mesh_id).ok_or(TranslateError::UnknownMesh {
                index,
                mesh: renderable.mesh_id,
            })?;
            objects.push(ObjectData::new(
                &renderable.world_transform,
                &renderable.world_scale,
                renderable.mesh_id.0,
                renderable.material_id,
                mesh.vertex_offset,
                mesh.first_index,
            ));
            *instance_counts.entry(renderable.mesh_id).or_insert(0) += 1;
        }

        let light_data: Vec<LightData> = lights
            .iter()
            .map(|light| {
                let d = light.direction.try_normalize(f32::EPSILON).unwrap_or_else(|| -Vec3::y());
                LightData {
                    direction: [d.x, d.y, d.z, 0.0],
                    color: [light.color.x, light.color.y, light.color.z, 1.0],
                }
            })
            .collect();

        let uniforms = SceneUniforms {
            view: mat4_to_cols(&camera.view),
            projection: mat4_to_cols(&camera.projection),
            view_projection: mat4_to_cols(&camera.view_projection),
            camera_position: [camera.position.x, camera.position.y, camera.position.z, 1.0],
            light_count: light_data.len() as u32,
            object_count: objects.len() as u32,
            shadows_enabled: self.shadows_enabled as u32,
            _padding: 0,
        };

        let frame = TranslatedFrame {
            camera,
            object_count: objects.len() as u32,
            light_count: light_data.len() as u32,
            instance_counts,
        };
        Ok(TranslatedData {
            frame,
            objects,
            uniforms,
            lights: light_data,
        })
    }

    /// Pack and write into `sink`; nothing is written on error
    pub fn translate_into(
        &self,
        scene: &dyn SceneSource,
        sink: &mut dyn SceneDataSink,
    ) -> Result<TranslatedFrame, TranslateError> {
        let data = self.translate(scene)?;
        sink.write_objects(&data.objects);
        sink.write_scene(&data.uniforms);
        sink.write_lights(&data.lights);
        log::trace!("Translated {} objects, {} lights", data.frame.object_count, data.frame.light_count);
        Ok(data.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4;
    use crate::render::mesh_bank::{MeshDescriptor, VertexLayout};
    use crate::scene::source::{DirectionalLight, RenderableInstance, StaticScene};
    use approx::assert_relative_eq;

    #[derive(Default)]
    struct RecordingSink {
        objects: Vec<ObjectData>,
        scene: Option<SceneUniforms>,
        lights: Vec<LightData>,
        writes: usize,
    }

    impl SceneDataSink for RecordingSink {
        fn write_objects(&mut self, objects: &[ObjectData]) {
            self.objects = objects.to_vec();
            self.writes += 1;
        }

        fn write_scene(&mut self, scene: &SceneUniforms) {
            self.scene = Some(*scene);
            self.writes += 1;
        }

        fn write_lights(&mut self, lights: &[LightData]) {
            self.lights = lights.to_vec();
            self.writes += 1;
        }
    }

    fn two_mesh_bank() -> MeshBank {
        let mut bank = MeshBank::new(VertexLayout { stride: 12, attributes: Vec::new() });
        bank.add_mesh(&[[0.0f32; 3]; 3], &[0, 1, 2], MeshDescriptor::new("a")).unwrap();
        bank.add_mesh(&[[0.0f32; 3]; 4], &[0, 1, 2, 2, 3, 0], MeshDescriptor::new("b")).unwrap();
        bank
    }

    fn lit_scene() -> StaticScene {
        let mut scene = StaticScene::new();
        scene.add_camera(CameraData::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros(), 1.0, 1.0, 0.1, 100.0));
        scene.add_light(DirectionalLight::new(Vec3::new(0.0, -2.0, 0.0), Vec3::repeat(1.0)));
        scene
    }

    #[test]
    fn test_missing_camera_writes_nothing() {
        let bank = two_mesh_bank();
        let mut scene = lit_scene();
        scene.cameras.clear();
        scene.add_renderable(RenderableInstance::new(MeshId(0), Mat4::identity()));

        let mut sink = RecordingSink::default();
        let result = SceneTranslator::new(&bank).translate_into(&scene, &mut sink);
        assert_eq!(result.unwrap_err(), TranslateError::NoCamera);
        assert_eq!(sink.writes, 0);
    }

    #[test]
    fn test_missing_light_writes_nothing() {
        let bank = two_mesh_bank();
        let mut scene = lit_scene();
        scene.lights.clear();

        let mut sink = RecordingSink::default();
        let result = SceneTranslator::new(&bank).translate_into(&scene, &mut sink);
        assert_eq!(result.unwrap_err(), TranslateError::NoLight);
        assert_eq!(sink.writes, 0);
    }

    #[test]
    fn test_unknown_mesh_rejected_before_writes() {
        let bank = two_mesh_bank();
        let mut scene = lit_scene();
        scene.add_renderable(RenderableInstance::new(MeshId(0), Mat4::identity()));
        scene.add_renderable(RenderableInstance::new(MeshId(9), Mat4::identity()));

        let mut sink = RecordingSink::default();
        let err = SceneTranslator::new(&bank).translate_into(&scene, &mut sink).unwrap_err();
        assert_eq!(err, TranslateError::UnknownMesh { index: 1, mesh: MeshId(9) });
        assert_eq!(sink.writes, 0);
    }

    #[test]
    fn test_objects_carry_mesh_placement() {
        let bank = two_mesh_bank();
        let mut scene = lit_scene();
        scene.add_renderable(RenderableInstance::new(MeshId(1), Mat4::new_translation(&Vec3::x())).with_material(7));
        scene.add_renderable(RenderableInstance::new(MeshId(0), Mat4::identity()));
        scene.add_renderable(RenderableInstance::new(MeshId(1), Mat4::identity()));

        let mut sink = RecordingSink::default();
        let frame = SceneTranslator::new(&bank).translate_into(&scene, &mut sink).unwrap();

        assert_eq!(frame.object_count, 3);
        assert_eq!(frame.instance_counts.get(&MeshId(1)), Some(&2));
        assert_eq!(sink.objects[0].mesh_id, 1);
        assert_eq!(sink.objects[0].material_id, 7);
        assert_eq!(sink.objects[0].vertex_offset, 3);
        assert_eq!(sink.objects[0].first_index, 3);
        assert_eq!(sink.objects[1].vertex_offset, 0);

        let uniforms = sink.scene.unwrap();
        assert_eq!(uniforms.object_count, 3);
        assert_eq!(uniforms.light_count, 1);
        assert_relative_eq!(sink.lights[0].direction[1], -1.0);
    }

    #[test]
    fn test_empty_scene_translates() {
        let bank = two_mesh_bank();
        let mut sink = RecordingSink::default();
        let frame = SceneTranslator::new(&bank).translate_into(&lit_scene(), &mut sink).unwrap();
        assert_eq!(frame.object_count, 0);
        assert!(sink.objects.is_empty());
        assert_eq!(sink.writes, 3);
    }
}
