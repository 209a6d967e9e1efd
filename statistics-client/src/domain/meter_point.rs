use super::statistic::{StreamId, StreamKind};

/// A physical metering device/location.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeterPoint {
    pub id: String,
    /// Key used in statistic ids; the lowercased id unless an alias key was assigned.
    pub slug: String,
    pub alias: Option<String>,
    pub active: bool,
    pub smart_meter_ready: bool,
}

impl MeterPoint {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            slug: id.to_lowercase(),
            id,
            alias: None,
            active: true,
            smart_meter_ready: true,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        let trimmed = alias.trim();
        self.alias = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    pub fn stream_id(&self, namespace: &str, kind: StreamKind) -> StreamId {
        StreamId::new(namespace, &self.slug, kind)
    }

    /// Metadata name of one of this meter's streams.
    pub fn stream_name(&self, kind: StreamKind) -> String {
        match kind.label() {
            Some(label) => format!("{} {label}", self.display_name()),
            None => self.display_name().to_string(),
        }
    }
}
