use eframe::egui;

/// The current signage image, uploaded once as a texture.
pub struct ImageFrame {
    texture: egui::TextureHandle,
    size: egui::Vec2,
}

impl ImageFrame {
    /// Decode PNG/JPEG/WebP bytes into a texture named `name`
    pub fn from_bytes(ctx: &egui::Context, name: &str, bytes: &[u8]) -> Result<Self, String> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| format!("Failed to decode image {}: {}", name, e))?;

        let size = [img.width() as usize, img.height() as usize];
        let pixels = img.to_rgba8();
        let color_image = egui::ColorImage::from_rgba_unmultiplied(size, pixels.as_raw());
        let texture = ctx.load_texture(name, color_image, egui::TextureOptions::LINEAR);

        Ok(Self {
            texture,
            size: egui::vec2(size[0] as f32, size[1] as f32),
        })
    }

    /// Largest size that fits `available` without distorting the image. Never upscales.
    pub fn fitted_size(&self, available: egui::Vec2) -> egui::Vec2 {
        fit_within(self.size, available)
    }

    pub fn show(&self, ui: &mut egui::Ui, available: egui::Vec2) {
        let size = self.fitted_size(available);
        ui.add(egui::Image::new((self.texture.id(), size)));
    }
}

fn fit_within(image: egui::Vec2, available: egui::Vec2) -> egui::Vec2 {
    if image.x <= 0.0 || image.y <= 0.0 {
        return egui::Vec2::ZERO;
    }
    let scale = (available.x / image.x).min(available.y / image.y).min(1.0).max(0.0);
    image * scale
}
