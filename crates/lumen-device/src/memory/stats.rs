use std::sync::atomic::{AtomicUsize, Ordering};

/// Device bytes in use, current and peak.
#[derive(Debug, Default)]
pub struct MemStats {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MemStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mem_alloc(&self, bytes: usize) {
        let now = self.current.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn mem_free(&self, bytes: usize) {
        let _ = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(bytes)));
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_survives_frees() {
        let stats = MemStats::new();
        stats.mem_alloc(100);
        stats.mem_alloc(50);
        stats.mem_free(100);
        stats.mem_alloc(20);
        assert_eq!(stats.current(), 70);
        assert_eq!(stats.peak(), 150);
    }
}
