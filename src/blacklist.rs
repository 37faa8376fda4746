//! Bounded ring of poisoned (engine ID, matrix ID) identities. Oldest
//! entries are overwritten; this is best-effort memory, not a set.

const DEFAULT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Default)]
struct Entry {
    engine_id: u16,
    matrix_id: u16,
    valid: bool,
}

pub struct Blacklist {
    entries: Vec<Entry>,
    cursor: usize,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Blacklist {
            entries: vec![Entry::default(); capacity.max(1)],
            cursor: 0,
        }
    }

    pub fn add(&mut self, engine_id: u16, matrix_id: u16) {
        if self.contains(engine_id, matrix_id) {
            return;
        }
        self.entries[self.cursor] = Entry {
            engine_id,
            matrix_id,
            valid: true,
        };
        self.cursor = (self.cursor + 1) % self.entries.len();
    }

    pub fn contains(&self, engine_id: u16, matrix_id: u16) -> bool {
        self.entries
            .iter()
            .any(|e| e.valid && e.engine_id == engine_id && e.matrix_id == matrix_id)
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}
