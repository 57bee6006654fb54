use std::fmt;

/// Handle to the driver's real-time poll loop. The engine only ever wakes
/// it; everything else about the loop belongs to the driver.
pub struct RtPoll {
    wake: Box<dyn Fn() + Send + Sync>,
}

impl RtPoll {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> RtPoll {
        RtPoll {
            wake: Box::new(wake),
        }
    }

    pub fn wake(&self) {
        (self.wake)();
    }
}

impl fmt::Debug for RtPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtPoll").finish_non_exhaustive()
    }
}
