use tokio::task::{JoinError, JoinSet};

/// Fan-out/join over blocking work.
///
/// Each unit starts running as soon as it is spawned and owns its own result
/// slot; `join` waits for every unit and hands the results back in spawn
/// order, whatever order they finished in.
pub struct TaskGroup<T> {
    set: JoinSet<(usize, T)>,
    spawned: usize,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            spawned: 0,
        }
    }

    /// Run `work` on the blocking pool. Returns the slot its result will
    /// occupy in `join`'s output.
    pub fn spawn_blocking<F>(&mut self, work: F) -> usize
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = self.spawned;
        self.set.spawn_blocking(move || (slot, work()));
        self.spawned += 1;
        slot
    }

    pub fn len(&self) -> usize {
        self.spawned
    }

    pub fn is_empty(&self) -> bool {
        self.spawned == 0
    }

    /// Wait for all units. A panicked unit fails the whole join.
    pub async fn join(mut self) -> Result<Vec<T>, JoinError> {
        let mut slots: Vec<Option<T>> = (0..self.spawned).map(|_| None).collect();
        while let Some(joined) = self.set.join_next().await {
            let (slot, value) = joined?;
            slots[slot] = Some(value);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
