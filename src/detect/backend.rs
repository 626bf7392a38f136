use anyhow::Result;
use image::RgbImage;

use crate::frame::FaceRect;

/// Length of a face embedding.
pub const ENCODING_LEN: usize = 128;

/// Face geometry backend: locates faces and computes their embeddings.
///
/// One backend instance belongs to one recognition consumer and is only ever called
/// from that consumer's thread, hence `&mut self` and `Send` without `Sync`.
pub trait FaceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Locate every face in `image`.
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<FaceRect>>;

    /// Compute one `ENCODING_LEN` embedding per face found at the given locations.
    ///
    /// Implementations may return fewer vectors than locations when a face cannot be
    /// encoded; callers decide whether that is an error.
    fn encode(&mut self, image: &RgbImage, locations: &[FaceRect]) -> Result<Vec<Vec<f64>>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
