use bytemuck::{Pod, Zeroable};

/// Device-side descriptor of one bindless texture.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureInfo {
    /// Texture object handle, or a device pointer for buffer-backed data.
    pub data: u64,
    pub interpolation: u32,
    pub extension: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub _pad: u32,
}

/// Host mirror of the bindless texture slot array.
///
/// Grows in multiples of `chunk` so that adding textures one by one does not
/// reallocate the device copy every time. Changes mark the array dirty; the
/// memory manager uploads it before the next launch that samples textures.
#[derive(Debug)]
pub struct TextureSlots {
    infos: Vec<TextureInfo>,
    chunk: usize,
    dirty: bool,
}

impl TextureSlots {
    pub fn new(chunk: usize) -> Self {
        Self {
            infos: Vec::new(),
            chunk: chunk.max(1),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, slot: usize) -> Option<&TextureInfo> {
        self.infos.get(slot)
    }

    pub fn insert(&mut self, slot: usize, info: TextureInfo) {
        if slot >= self.infos.len() {
            let len = (slot + 1).div_ceil(self.chunk) * self.chunk;
            self.infos.resize(len, TextureInfo::default());
        }
        self.infos[slot] = info;
        self.dirty = true;
    }

    /// Empties `slot` so kernels never see a destroyed texture.
    pub fn clear(&mut self, slot: usize) {
        if let Some(info) = self.infos.get_mut(slot) {
            *info = TextureInfo::default();
            self.dirty = true;
        }
    }

    pub fn as_slice(&self) -> &[TextureInfo] {
        &self.infos
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// Slot index encoded in a bindless texture name (`__tex_image_<type>_<NNN>`).
pub fn texture_slot(name: &str) -> Option<usize> {
    if !name.starts_with("__tex_image") {
        return None;
    }
    name.rsplit('_').next()?.parse().ok()
}

/// Texture reference a legacy texture binds to.
///
/// 3D textures live in separate `__tex_image_<type>_3d_<NNN>` references;
/// everything else binds under its own name.
pub fn legacy_bind_name(name: &str, dimensions: u32) -> String {
    if dimensions == 3 {
        let tokens: Vec<&str> = name.split('_').filter(|t| !t.is_empty()).collect();
        if let [_, _, ty, num, ..] = tokens[..] {
            return format!("__tex_image_{ty}_3d_{num}");
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(data: u64) -> TextureInfo {
        TextureInfo {
            data,
            ..TextureInfo::default()
        }
    }

    #[test]
    fn descriptor_layout_is_stable() {
        assert_eq!(size_of::<TextureInfo>(), 32);
    }

    #[test]
    fn grows_in_whole_chunks() {
        let mut slots = TextureSlots::new(128);
        assert!(slots.is_empty());

        slots.insert(0, info(1));
        assert_eq!(slots.len(), 128);

        slots.insert(127, info(2));
        assert_eq!(slots.len(), 128);

        slots.insert(128, info(3));
        assert_eq!(slots.len(), 256);

        slots.insert(300, info(4));
        assert_eq!(slots.len(), 384);
        assert_eq!(slots.get(300), Some(&info(4)));
        assert_eq!(slots.get(299), Some(&TextureInfo::default()));
    }

    #[test]
    fn changes_mark_dirty() {
        let mut slots = TextureSlots::new(4);
        assert!(!slots.is_dirty());
        slots.insert(2, info(7));
        assert!(slots.is_dirty());
        slots.mark_clean();
        slots.clear(9);
        assert!(!slots.is_dirty());
        slots.clear(2);
        assert!(slots.is_dirty());
        assert_eq!(slots.get(2), Some(&TextureInfo::default()));
    }

    #[test]
    fn slot_is_parsed_from_the_name() {
        assert_eq!(texture_slot("__tex_image_float4_012"), Some(12));
        assert_eq!(texture_slot("__tex_image_byte_3d_007"), Some(7));
        assert_eq!(texture_slot("__bvh_nodes"), None);
        assert_eq!(texture_slot("__tex_image_float4_x"), None);
    }

    #[test]
    fn volumes_bind_to_3d_references() {
        assert_eq!(legacy_bind_name("__tex_image_float4_005", 3), "__tex_image_float4_3d_005");
        assert_eq!(legacy_bind_name("__tex_image_float4_005", 2), "__tex_image_float4_005");
    }
}
