use crate::codecs::Codec;

/// An elementary stream of a HLS presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub codec: Codec,
    pub clock_rate: u32,
    /// Rendition name, used in `EXT-X-MEDIA`.
    pub name: Option<String>,
    pub language: Option<String>,
    pub is_default: bool,
}

impl Track {
    pub fn new(codec: Codec) -> Self {
        Self {
            clock_rate: codec.clock_rate(),
            codec,
            name: None,
            language: None,
            is_default: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }
}
