//! Face geometry: backend trait, built-in backends and the name-based registry.
//!
//! - `stub`: scripted faces, always available
//! - `tract`: ONNX detector and embedder, behind the `backend-tract` feature

mod backend;
mod backends;
pub mod proposals;
mod registry;

pub use backend::{FaceBackend, ENCODING_LEN};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractFaceBackend;
pub use registry::BackendRegistry;
