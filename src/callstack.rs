use std::ops::Deref;

/// Program counters of the frames active when a block was allocated.
///
/// Frames are stored newest first: index 0 is the innermost caller that was
/// captured. A `CallStack` is immutable once captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Box<[usize]>,
}

impl CallStack {
    /// Returns the program counters, newest first.
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }
}

impl From<&[usize]> for CallStack {
    fn from(frames: &[usize]) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl From<Vec<usize>> for CallStack {
    fn from(frames: Vec<usize>) -> Self {
        Self {
            frames: frames.into_boxed_slice(),
        }
    }
}

impl Deref for CallStack {
    type Target = [usize];

    fn deref(&self) -> &Self::Target {
        &self.frames
    }
}
