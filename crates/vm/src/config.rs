/// Collector tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcConfig {
    /// Estimated heap bytes that trigger the first collection
    pub initial_threshold: usize,
    /// The next threshold is the live size after a collection times this
    pub growth_factor: f64,
}

const INIT_GC_THRESHOLD: usize = 100 * 1024;

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_threshold: INIT_GC_THRESHOLD,
            growth_factor: 1.5,
        }
    }
}

impl GcConfig {
    pub fn with_initial_threshold(mut self, bytes: usize) -> Self {
        self.initial_threshold = bytes;
        self
    }

    pub fn with_growth_factor(mut self, factor: f64) -> Self {
        assert!(factor >= 1.0, "growth factor must be at least 1");
        self.growth_factor = factor;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VmConfig {
    /// Frames a single fiber may hold before `SystemStackError` is raised
    pub max_call_depth: usize,
    /// Nested host-level interpreter loops (natives calling back into
    /// bytecode, fiber resumes) allowed before `SystemStackError` is raised
    pub max_native_depth: usize,
    /// Register slots reserved for the root context
    pub initial_stack: usize,
    pub gc: GcConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 512,
            max_native_depth: 48,
            initial_stack: 128,
            gc: GcConfig::default(),
        }
    }
}

impl VmConfig {
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        assert!(depth > 0);
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_native_depth(mut self, depth: usize) -> Self {
        assert!(depth > 0);
        self.max_native_depth = depth;
        self
    }

    pub fn with_initial_stack(mut self, slots: usize) -> Self {
        self.initial_stack = slots;
        self
    }

    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }
}
