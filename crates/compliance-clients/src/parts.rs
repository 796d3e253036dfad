//! Provider-agnostic multimodal message parts. Nothing outside this crate should need to know
//! what `async-openai`'s request shape looks like.

use base64::Engine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageDetail {
    Low,
    Auto,
}

#[derive(Clone, Debug)]
pub enum Part {
    Text(String),
    Image { mime: &'static str, bytes: Vec<u8>, detail: ImageDetail },
    VideoClip { mime: &'static str, bytes: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn jpeg(bytes: Vec<u8>, detail: ImageDetail) -> Self {
        Part::Image { mime: "image/jpeg", bytes, detail }
    }

    pub fn png(bytes: Vec<u8>, detail: ImageDetail) -> Self {
        Part::Image { mime: "image/png", bytes, detail }
    }

    pub fn mp4_clip(bytes: Vec<u8>) -> Self {
        Part::VideoClip { mime: "video/mp4", bytes }
    }

    /// `data:<mime>;base64,<...>` form used by every content part that
    /// carries binary payload.
    pub fn data_url(mime: &str, bytes: &[u8]) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        format!("data:{mime};base64,{encoded}")
    }
}

/// Accumulates [`Part`]s in order; the vision/combined/remote-GPU clients
/// each know how to turn the finished sequence into their provider's wire
/// format without exposing that format to callers.
#[derive(Default)]
pub struct PartsBuilder {
    parts: Vec<Part>,
}

impl PartsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::text(text));
        self
    }

    pub fn push_image(mut self, mime: &'static str, bytes: Vec<u8>, detail: ImageDetail) -> Self {
        self.parts.push(Part::Image { mime, bytes, detail });
        self
    }

    pub fn push_video_clip(mut self, mime: &'static str, bytes: Vec<u8>) -> Self {
        self.parts.push(Part::VideoClip { mime, bytes });
        self
    }

    pub fn build(self) -> Vec<Part> {
        self.parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_round_trips_through_base64() {
        let url = Part::data_url("image/jpeg", &[1, 2, 3, 4]);
        assert!(url.starts_with("data:image/jpeg;base64,"));
        let encoded = url.split(',').nth(1).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, vec![1, 2, 3, 4]);
    }

    #[test]
    fn builder_preserves_push_order() {
        let parts = PartsBuilder::new()
            .push_text("preamble")
            .push_image("image/jpeg", vec![0xff], ImageDetail::Low)
            .push_text("separator")
            .build();

        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[0], Part::Text(_)));
        assert!(matches!(parts[1], Part::Image { .. }));
        assert!(matches!(parts[2], Part::Text(_)));
    }
}
