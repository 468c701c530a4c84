use serde::{Deserialize, Serialize};

/// Store configuration
///
/// # Examples
///
/// ```
/// use itemsync::StoreConfig;
///
/// let config = StoreConfig::new("todos")
///     .auto_save(false)
///     .marker_field("syncState");
/// assert_eq!(config.name, "todos");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Collection name, used in log output
    pub name: String,

    /// Whether field writes through `Item::set` schedule an update by default
    pub auto_save: bool,

    /// Field under which the local cache persists the transporter-state marker
    pub marker_field: String,
}

impl StoreConfig {
    /// Create a configuration with defaults for the named collection
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Set the collection name
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Enable or disable auto-save for new records
    pub fn auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }

    /// Set the marker field name
    pub fn marker_field(mut self, field: &str) -> Self {
        self.marker_field = field.to_string();
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "items".to_string(),
            auto_save: true,
            marker_field: "transporterState".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert!(config.auto_save);
        assert_eq!(config.marker_field, "transporterState");
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::new("notes").name("renamed").auto_save(false);
        assert_eq!(config.name, "renamed");
        assert!(!config.auto_save);
    }
}
