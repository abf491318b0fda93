//! Paint layers and the combined blend textures they are packed into

use crate::math::Rect;
use crate::render::ResourceHandle;
use super::params::MaterialHandle;

/// Per-block weight map of one material.
///
/// Weights cover the stored blend map including its 1-texel border. The
/// erase layer of a stroke has no material and never owns a texture channel.
#[derive(Clone, Debug)]
pub struct PaintLayer {
    /// Database row id, 0 until first saved
    pub(crate) layer_id: i64,
    pub(crate) material: Option<MaterialHandle>,
    pub(crate) reference_count: u32,
    pub(crate) weights: Vec<u8>,
    /// Accumulated brush coverage of the active stroke
    pub(crate) paint_buffer: Option<Vec<u8>>,
    pub(crate) texture: Option<usize>,
    pub(crate) channel: usize,
    /// Stored-texel region painted since the last preview
    pub(crate) dirty: Option<Rect>,
    /// Stored-texel region whose channel data differs from `weights`
    pub(crate) final_dirty: Option<Rect>,
    pub(crate) erase: bool,
    /// Weights changed since last persisted
    pub(crate) modified: bool,
}

impl PaintLayer {
    pub fn new(material: MaterialHandle, texel_count: usize) -> Self {
        Self::with_weights(Some(material), vec![0; texel_count])
    }

    pub(crate) fn erase_layer(texel_count: usize) -> Self {
        let mut layer = Self::with_weights(None, vec![0; texel_count]);
        layer.erase = true;
        layer
    }

    pub(crate) fn with_weights(material: Option<MaterialHandle>, weights: Vec<u8>) -> Self {
        let mut layer = Self {
            layer_id: 0,
            material,
            reference_count: 0,
            weights,
            paint_buffer: None,
            texture: None,
            channel: 0,
            dirty: None,
            final_dirty: None,
            erase: false,
            modified: false,
        };
        layer.recount_references();
        layer
    }

    pub fn layer_id(&self) -> i64 {
        self.layer_id
    }

    pub fn material(&self) -> Option<&MaterialHandle> {
        self.material.as_ref()
    }

    pub fn material_id(&self) -> Option<u32> {
        self.material.as_ref().map(|m| m.id)
    }

    /// Number of stored texels with non-zero weight
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    pub fn weights(&self) -> &[u8] {
        &self.weights
    }

    /// Combined texture index and RGBA channel this layer is packed into
    pub fn assignment(&self) -> Option<(usize, usize)> {
        self.texture.map(|t| (t, self.channel))
    }

    pub fn is_erase(&self) -> bool {
        self.erase
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn has_normal_map(&self) -> bool {
        self.material.as_ref().is_some_and(|m| m.has_normal_map())
    }

    pub(crate) fn recount_references(&mut self) {
        self.reference_count = self.weights.iter().filter(|w| **w > 0).count() as u32;
    }

    pub(crate) fn mark_dirty(&mut self, rect: Rect) {
        self.dirty = Some(self.dirty.map_or(rect, |d| d.union(&rect)));
    }

    pub(crate) fn mark_final_dirty(&mut self, rect: Rect) {
        self.final_dirty = Some(self.final_dirty.map_or(rect, |d| d.union(&rect)));
    }
}

/// RGBA8 texture holding up to four layer weights per texel
#[derive(Clone, Debug)]
pub struct CombinedBlendTexture {
    pub(crate) handle: Option<ResourceHandle>,
    /// CPU mirror, tightly packed RGBA over the stored blend map
    pub(crate) data: Vec<u8>,
    /// Bit per channel owned by a layer
    pub(crate) channel_mask: u8,
    pub(crate) dirty: Option<Rect>,
}

impl CombinedBlendTexture {
    pub(crate) fn new(texel_count: usize, full: Rect) -> Self {
        Self {
            handle: None,
            data: vec![0; texel_count * 4],
            channel_mask: 0,
            dirty: Some(full),
        }
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        self.handle
    }

    pub fn channel_mask(&self) -> u8 {
        self.channel_mask
    }

    pub fn texel(&self, index: usize) -> [u8; 4] {
        let i = index * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    pub(crate) fn channel(&self, index: usize, channel: usize) -> u8 {
        self.data[index * 4 + channel]
    }

    pub(crate) fn set_channel(&mut self, index: usize, channel: usize, value: u8) {
        self.data[index * 4 + channel] = value;
    }

    pub(crate) fn mark_dirty(&mut self, rect: Rect) {
        self.dirty = Some(self.dirty.map_or(rect, |d| d.union(&rect)));
    }
}

/// One draw pass: up to four layers sharing a combined texture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderBatch {
    /// Layer indices in shader slot order; bump-mapped layers come first
    pub layers: Vec<usize>,
    pub texture: usize,
    /// Weights live in the texture's blue/alpha channels
    pub swizzle: bool,
}

impl RenderBatch {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::paint::params::LayerMaterial;

    #[test]
    fn test_reference_count_tracks_non_zero_texels() {
        let material = Arc::new(LayerMaterial::new(1, "rock"));
        let layer = PaintLayer::with_weights(Some(material), vec![0, 3, 0, 255, 1]);
        assert_eq!(layer.reference_count(), 3);
        assert_eq!(layer.material_id(), Some(1));
        assert!(!layer.is_erase());
    }

    #[test]
    fn test_dirty_rects_accumulate() {
        let mut layer = PaintLayer::erase_layer(16);
        layer.mark_dirty(Rect::new(0, 0, 1, 1));
        layer.mark_dirty(Rect::new(2, 2, 3, 3));
        assert_eq!(layer.dirty, Some(Rect::new(0, 0, 3, 3)));
        assert!(layer.material().is_none());
    }

    #[test]
    fn test_combined_texture_channels() {
        let mut texture = CombinedBlendTexture::new(4, Rect::new(0, 0, 2, 2));
        texture.set_channel(2, 3, 77);
        assert_eq!(texture.texel(2), [0, 0, 0, 77]);
        assert_eq!(texture.channel(2, 3), 77);
        assert_eq!(texture.dirty, Some(Rect::new(0, 0, 2, 2)));
    }
}
