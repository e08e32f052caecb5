use crate::collector::batch::LogBatch;
use crate::source::event::parse_structured;

/// Fills `parsed` on entries whose line is a JSON object.
#[derive(Debug, Clone, Copy)]
pub struct JsonParser {
    enabled: bool,
}

impl JsonParser {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Returns how many entries gained a structured payload. Entries that
    /// already carry one, and lines that are not JSON objects, are left alone.
    pub fn apply(&self, batch: &mut LogBatch) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut parsed = 0;
        for entry in batch.entries.iter_mut().filter(|e| e.parsed.is_none()) {
            if let Some(map) = parse_structured(&entry.line) {
                entry.parsed = Some(map);
                parsed += 1;
            }
        }
        parsed
    }
}
