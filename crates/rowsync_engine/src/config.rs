//! Configuration for the sync context.

/// Tunables for the sync context.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum rows per pull page. Caller-supplied `top` values are
    /// clamped to this.
    pub page_size: u32,
}

impl SyncConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self { page_size: 50 }
    }

    /// Sets the maximum pull page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_size() {
        assert_eq!(SyncConfig::default().page_size, 50);
    }

    #[test]
    fn builder_overrides() {
        let config = SyncConfig::new().with_page_size(10);
        assert_eq!(config.page_size, 10);
    }
}
