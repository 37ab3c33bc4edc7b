use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};

use crate::annotate::Overlay;
use crate::{CameraPose, Mode, PoseUpdate};

/// Runtime settings mutated by the request layer and read once per tick by the worker.
#[derive(Debug)]
pub struct Controls {
    values: RwLock<Overlay>,
}

impl Controls {
    pub fn new(mode: Mode, privacy_blur: bool, pose: CameraPose) -> Self {
        Self {
            values: RwLock::new(Overlay {
                mode,
                privacy_blur,
                pose,
            }),
        }
    }

    /// Consistent copy of every setting.
    pub fn current(&self) -> Overlay {
        *self.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> Mode {
        self.current().mode
    }

    pub fn blur_enabled(&self) -> bool {
        self.current().privacy_blur
    }

    pub fn pose(&self) -> CameraPose {
        self.current().pose
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.write(|values| values.mode = mode)
    }

    pub fn set_blur(&self, enabled: bool) -> Result<()> {
        self.write(|values| values.privacy_blur = enabled)
    }

    /// Apply a partial pose update. Invalid results are rejected and nothing changes.
    pub fn update_pose(&self, update: &PoseUpdate) -> Result<CameraPose> {
        let mut values = self
            .values
            .write()
            .map_err(|_| anyhow!("controls lock poisoned"))?;
        let mut pose = values.pose;
        pose.apply(update);
        pose.validate()?;
        values.pose = pose;
        Ok(pose)
    }

    fn write(&self, f: impl FnOnce(&mut Overlay)) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| anyhow!("controls lock poisoned"))?;
        f(&mut values);
        Ok(())
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new(Mode::Sar, true, CameraPose::default())
    }
}
