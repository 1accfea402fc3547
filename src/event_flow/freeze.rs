// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The freeze state machine: halts event creation at a scheduled instant
//! while signature collection keeps running.

use crate::error::{Error, Result};
use crate::LogMarker;

use std::sync::Mutex;
use std::time::SystemTime;

/// Where the node stands relative to the scheduled freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeStage {
    /// Normal operation.
    NotInFreeze,
    /// The freeze instant has passed; no more self events.
    InFreeze,
    /// The frozen state has been signed; waiting for shutdown or the window
    /// to end.
    FreezeComplete,
}

type Callback = Box<dyn Fn(FreezeStage) + Send + Sync>;

/// Serialized freeze transitions plus the configured window.
pub struct FreezeControl {
    stage: Mutex<FreezeStage>,
    window: Mutex<Option<(SystemTime, SystemTime)>>,
    callback: Mutex<Option<Callback>>,
}

impl std::fmt::Debug for FreezeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FreezeControl")
            .field("stage", &self.stage())
            .finish()
    }
}

impl Default for FreezeControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FreezeControl {
    /// Not in freeze, no window scheduled.
    pub fn new() -> Self {
        Self {
            stage: Mutex::new(FreezeStage::NotInFreeze),
            window: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    /// Schedules the freeze window.
    pub fn set_window(&self, start: SystemTime, end: SystemTime) {
        *self.window.lock().expect("freeze lock poisoned") = Some((start, end));
    }

    /// Registers the state-change notification.
    pub fn on_change(&self, callback: impl Fn(FreezeStage) + Send + Sync + 'static) {
        *self.callback.lock().expect("freeze lock poisoned") = Some(Box::new(callback));
    }

    /// Current stage.
    pub fn stage(&self) -> FreezeStage {
        *self.stage.lock().expect("freeze lock poisoned")
    }

    /// Whether `t` falls inside the scheduled window.
    pub fn is_in_freeze_period(&self, t: SystemTime) -> bool {
        match *self.window.lock().expect("freeze lock poisoned") {
            Some((start, end)) => t >= start && t < end,
            None => false,
        }
    }

    /// `NotInFreeze -> InFreeze`. Any other starting point is fatal.
    pub fn freeze_started(&self) -> Result<()> {
        self.transition(FreezeStage::NotInFreeze, FreezeStage::InFreeze)?;
        info!("{}", LogMarker::FreezeStarted);
        Ok(())
    }

    /// `InFreeze -> FreezeComplete`. Any other starting point is fatal.
    pub fn freeze_complete(&self) -> Result<()> {
        self.transition(FreezeStage::InFreeze, FreezeStage::FreezeComplete)?;
        info!("{}", LogMarker::FreezeComplete);
        Ok(())
    }

    // Transitions are mutually exclusive under the stage lock; an
    // out-of-order attempt is a fatal error, the node must not keep running
    // on a half-frozen state.
    fn transition(&self, from: FreezeStage, to: FreezeStage) -> Result<()> {
        let mut stage = self.stage.lock().expect("freeze lock poisoned");
        if *stage != from {
            return Err(Error::FreezeTransition(*stage, to));
        }
        *stage = to;
        drop(stage);
        if let Some(cb) = self.callback.lock().expect("freeze lock poisoned").as_ref() {
            cb(to);
        }
        Ok(())
    }

    /// The event-creation vote: no self events while freezing or frozen.
    pub fn should_create_event(&self) -> bool {
        self.stage() == FreezeStage::NotInFreeze
    }

    /// Gossip continues in every stage so signatures keep flowing.
    pub fn should_sync(&self) -> bool {
        true
    }
}
