//! Scene boundary
//!
//! The renderer reads scenes through [`SceneSource`] and never stores
//! gameplay state. [`SceneTranslator`] packs a snapshot into GPU records;
//! [`TransformHierarchy`] is a small helper for sources that need parented
//! transforms.
//!
//! ```text
//! SceneSource (game / ECS / StaticScene)
//!      |
//! SceneTranslator  --validates-->  TranslateError (frame skipped)
//!      |
//! SceneDataSink (current frame slot's buffers)
//! ```

pub mod hierarchy;
pub mod source;
pub mod translator;

pub use hierarchy::{HierarchyError, NodeId, TransformHierarchy, WorldTransform};
pub use source::{CameraData, DirectionalLight, RenderableInstance, SceneSource, StaticScene};
pub use translator::{SceneDataSink, SceneTranslator, TranslateError, TranslatedData, TranslatedFrame};
