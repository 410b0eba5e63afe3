/// Single status text describing what the pipeline is doing.
///
/// Only the pipeline writes it. Every change is logged; an update identical to
/// the current text is a no-op so dashboards are not flooded by repeats.
#[derive(Debug, Default)]
pub struct StatusReporter {
    current: String,
    updates: u64,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status. Returns true when the text changed.
    pub(crate) fn report(&mut self, message: &str) -> bool {
        if self.current == message {
            return false;
        }
        log::info!("status: {}", message);
        self.current = message.to_string();
        self.updates += 1;
        true
    }

    /// Set the status even if it repeats. Used for retry notices, which must
    /// surface once per failure.
    pub(crate) fn announce(&mut self, message: &str) {
        log::info!("status: {}", message);
        self.current = message.to_string();
        self.updates += 1;
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    /// Number of distinct updates so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_suppressed() {
        let mut status = StatusReporter::new();
        assert!(status.report("Loading Main St..."));
        assert!(!status.report("Loading Main St..."));
        assert!(status.report("Main St - Live feed active"));
        assert_eq!(status.current(), "Main St - Live feed active");
        assert_eq!(status.updates(), 2);
    }

    #[test]
    fn announcements_always_count() {
        let mut status = StatusReporter::new();
        status.announce("Failed to load Main St - Retrying...");
        status.announce("Failed to load Main St - Retrying...");
        assert_eq!(status.updates(), 2);
        assert!(!status.report("Failed to load Main St - Retrying..."));
    }
}
