//! Host processing elements.

/// A processing element (CPU core equivalent) with a nominal MIPS capacity.
#[derive(Clone)]
pub struct Pe {
    id: u32,
    mips: f64,
    failed: bool,
}

impl Pe {
    pub fn new(id: u32, mips: f64) -> Self {
        Self {
            id,
            mips,
            failed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mips(&self) -> f64 {
        self.mips
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn set_failed(&mut self, failed: bool) {
        self.failed = failed;
    }
}

/// Builds a list of identical PEs.
pub fn make_pe_list(count: u32, mips: f64) -> Vec<Pe> {
    (0..count).map(|id| Pe::new(id, mips)).collect()
}
