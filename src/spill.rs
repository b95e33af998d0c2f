//! A volume that continues in `<base>.001`, `<base>.002`, ... once it grows
//! past a size limit.
//!
//! A set hook watches `aff4:directory_offset` of the current volume. The
//! switch itself runs as deferred work since the hook fires while a writer
//! still holds the volume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::resolver::{HookId, Resolver};
use crate::urn::{attr, types};
use crate::volume;

struct SpillState {
    base: String,
    max_size: u64,
    volumes: Mutex<Vec<String>>,
    rolling: AtomicBool,
}

pub struct VolumeSpill {
    resolver: Resolver,
    state: Arc<SpillState>,
    hook: HookId,
}

pub fn successor_uri(base: &str, n: usize) -> String {
    format!("{}.{:03}", base, n)
}

impl VolumeSpill {
    /// Start writing at `base_uri`, `max_size` 0 never spills.
    pub fn create(resolver: &Resolver, base_uri: &str, max_size: u64) -> Result<Self> {
        let first = volume::create(resolver, base_uri)?;
        let state = Arc::new(SpillState {
            base: base_uri.to_string(),
            max_size,
            volumes: Mutex::new(vec![first]),
            rolling: AtomicBool::new(false),
        });

        let watched = state.clone();
        let hook = resolver.on_set(Some(attr::DIRECTORY_OFFSET), move |r, subject, _, value| {
            if watched.max_size == 0 || watched.current().as_deref() != Some(subject) {
                return;
            }
            let size: u64 = value.parse().unwrap_or(0);
            if size > watched.max_size && !watched.rolling.swap(true, Ordering::SeqCst) {
                let state = watched.clone();
                r.defer(Box::new(move |r: &Resolver| state.rollover(r)));
            }
        });

        Ok(VolumeSpill {
            resolver: resolver.clone(),
            state,
            hook,
        })
    }

    /// Volume new streams should go into.
    pub fn current(&self) -> String {
        self.state.volumes.lock().last().cloned().unwrap_or_default()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state.volumes.lock().clone()
    }

    /// Finish pending switches and close every volume of the set.
    pub fn close(self) -> Result<()> {
        self.resolver.run_deferred()?;
        self.resolver.remove_hook(self.hook);

        for volume in self.volumes().iter().rev() {
            self.resolver.close_volume(volume)?;
        }
        Ok(())
    }
}

impl SpillState {
    fn current(&self) -> Option<String> {
        self.volumes.lock().last().cloned()
    }

    fn rollover(&self, resolver: &Resolver) -> Result<()> {
        let res = self.switch(resolver);
        self.rolling.store(false, Ordering::SeqCst);
        res
    }

    fn switch(&self, resolver: &Resolver) -> Result<()> {
        let (old, n) = {
            let volumes = self.volumes.lock();
            match volumes.last() {
                Some(v) => (v.clone(), volumes.len()),
                None => return Ok(()),
            }
        };
        let old_uri = resolver.require(&old, attr::STORED)?;
        let new_uri = successor_uri(&self.base, n);
        let new = volume::create(resolver, &new_uri)?;

        resolver.add(&old, attr::AUTOLOAD, &new_uri);
        resolver.add(&new, attr::AUTOLOAD, &old_uri);

        // Streams still being written continue in the new volume
        for subject in resolver.resolve_list(&old, attr::CONTAINS) {
            let is_segment = resolver.resolve(&subject, attr::TYPE).as_deref() == Some(types::SEGMENT);
            if is_segment || !resolver.resolve_bool(&subject, attr::DIRTY) {
                continue;
            }
            resolver.set(&subject, attr::STORED, &new);
            resolver.delete_value(&old, attr::CONTAINS, &subject);
            resolver.add(&new, attr::CONTAINS, &subject);
        }

        self.volumes.lock().push(new.clone());
        info!("Volume {} is full, continuing in {} on {}", old, new, new_uri);

        if let Err(e) = resolver.close_volume(&old) {
            warn!("Closing full volume {} failed: {}", old, e);
            return Err(e);
        }
        Ok(())
    }
}
