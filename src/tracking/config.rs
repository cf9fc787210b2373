/// Change tracking configuration
///
/// Built the same way as a connection configuration: start from `new()` (or
/// `default()`) and chain setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingConfig {
    /// Run change detection at the start of every save
    pub auto_detect_changes: bool,

    /// Poll every entry, even objects that raise change notifications
    pub force_eager_snapshots: bool,

    /// Include property values in log events
    pub sensitive_logging: bool,

    /// Upper bound on foreign-key fix-up steps per notification
    pub max_fixup_steps: usize,
}

impl TrackingConfig {
    pub fn new() -> Self {
        Self {
            auto_detect_changes: true,
            force_eager_snapshots: false,
            sensitive_logging: false,
            max_fixup_steps: 10_000,
        }
    }

    /// Enable or disable detection on save
    pub fn auto_detect_changes(mut self, enabled: bool) -> Self {
        self.auto_detect_changes = enabled;
        self
    }

    /// Force snapshot polling for all entries
    pub fn force_eager_snapshots(mut self, enabled: bool) -> Self {
        self.force_eager_snapshots = enabled;
        self
    }

    /// Log property values (may expose user data)
    pub fn sensitive_logging(mut self, enabled: bool) -> Self {
        self.sensitive_logging = enabled;
        self
    }

    /// Set the fix-up step cap
    pub fn max_fixup_steps(mut self, steps: usize) -> Self {
        self.max_fixup_steps = steps.max(1);
        self
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackingConfig::default();
        assert!(config.auto_detect_changes);
        assert!(!config.force_eager_snapshots);
        assert!(!config.sensitive_logging);
        assert_eq!(config.max_fixup_steps, 10_000);
    }

    #[test]
    fn test_builder_pattern() {
        let config = TrackingConfig::new()
            .auto_detect_changes(false)
            .force_eager_snapshots(true)
            .max_fixup_steps(0);

        assert!(!config.auto_detect_changes);
        assert!(config.force_eager_snapshots);
        assert_eq!(config.max_fixup_steps, 1);
    }
}
