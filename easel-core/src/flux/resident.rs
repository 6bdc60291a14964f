use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{anyhow, bail, Result};

/// The one device-resident copy of a model, tagged with what was fused into
/// it. At most one copy is alive at a time: the current model is dropped
/// before its replacement is built.
pub(crate) struct Resident<M, T> {
    model: RwLock<Option<Arc<M>>>,
    tag: Mutex<T>,
}

impl<M, T: Clone + Default> Resident<M, T> {
    pub fn new(model: M, tag: T) -> Self {
        Self {
            model: RwLock::new(Some(Arc::new(model))),
            tag: Mutex::new(tag),
        }
    }

    fn lock_tag(&self) -> Result<MutexGuard<'_, T>> {
        self.tag.lock().map_err(|_| anyhow!("resident tag lock poisoned"))
    }

    pub fn get(&self) -> Result<Arc<M>> {
        match &*self
            .model
            .read()
            .map_err(|_| anyhow!("resident model lock poisoned"))?
        {
            Some(model) => Ok(model.clone()),
            None => bail!("no model is resident, the last rebuild failed"),
        }
    }

    pub fn is_resident(&self) -> Result<bool> {
        Ok(self
            .model
            .read()
            .map_err(|_| anyhow!("resident model lock poisoned"))?
            .is_some())
    }

    pub fn tag(&self) -> Result<T> {
        Ok(self.lock_tag()?.clone())
    }

    /// Releases the current model, then installs whatever `build` returns.
    /// A failed build leaves nothing resident and resets the tag.
    pub fn replace(&self, tag: T, build: impl FnOnce() -> Result<M>) -> Result<()> {
        let mut model = self
            .model
            .write()
            .map_err(|_| anyhow!("resident model lock poisoned"))?;
        *model = None;
        *self.lock_tag()? = T::default();
        *model = Some(Arc::new(build()?));
        *self.lock_tag()? = tag;
        Ok(())
    }
}
