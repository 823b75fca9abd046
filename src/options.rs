//! Coroutine options

/// Default coroutine stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128_000;

/// Coroutine spawn options
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// The size of the stack
    pub stack_size: usize,

    /// Whether yield/resume pair the coroutine with the thread's scheduler
    /// coroutine (true) or with the thread's main coroutine (false)
    pub run_in_scheduler: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
            run_in_scheduler: true,
        }
    }
}
