//! One-shot units of work

use scenecast_core::SceneCastResult;

/// A unit of work executed exactly once by one worker
///
/// `release` runs after `execute` (also after a failed or panicking
/// `execute`) and for tasks that are discarded unexecuted at shutdown.
pub trait Task: Send {
    fn execute(&mut self) -> SceneCastResult<()>;

    fn release(self: Box<Self>) {}
}

/// Adapter turning a closure into a [`Task`]
pub struct FnTask<F> {
    f: Option<F>,
}

impl<F> FnTask<F>
where
    F: FnOnce() -> SceneCastResult<()> + Send,
{
    pub fn new(f: F) -> Self {
        FnTask { f: Some(f) }
    }
}

impl<F> Task for FnTask<F>
where
    F: FnOnce() -> SceneCastResult<()> + Send,
{
    fn execute(&mut self) -> SceneCastResult<()> {
        match self.f.take() {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}
