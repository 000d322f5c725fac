// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Settings for a [`VerificationManager`].
///
/// [`VerificationManager`]: crate::VerificationManager
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerificationManagerConfig {
    pub(crate) initial_sync: bool,
    pub(crate) update_channel_capacity: usize,
}

impl Default for VerificationManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl VerificationManagerConfig {
    /// Create new default settings.
    #[must_use]
    pub fn new() -> Self {
        Self { initial_sync: false, update_channel_capacity: DEFAULT_CHANNEL_CAPACITY }
    }

    /// Whether the manager starts out in the initial sync phase.
    ///
    /// While the initial sync is in progress all inbound verification events
    /// are ignored, they were replayed from the backlog and don't represent
    /// verifications the other side is still waiting on.
    ///
    /// # Arguments
    ///
    /// * `initial_sync` - Whether the initial sync is in progress.
    #[must_use]
    pub fn initial_sync(mut self, initial_sync: bool) -> Self {
        self.initial_sync = initial_sync;
        self
    }

    /// Set the capacity of the channels that carry notifications about new
    /// sessions and user facing notices.
    ///
    /// Subscribers lagging behind by more than this many notifications will
    /// miss the oldest ones. A capacity of zero is bumped to one.
    #[must_use]
    pub fn update_channel_capacity(mut self, capacity: usize) -> Self {
        self.update_channel_capacity = capacity;
        self
    }

    pub(crate) fn channel_capacity(&self) -> usize {
        self.update_channel_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::VerificationManagerConfig;

    #[test]
    fn deserialize_partial_config() {
        let config: VerificationManagerConfig =
            serde_json::from_value(json!({ "initial_sync": true })).unwrap();

        assert_eq!(config, VerificationManagerConfig::new().initial_sync(true));
        assert_eq!(config.channel_capacity(), 32);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let config = VerificationManagerConfig::new().update_channel_capacity(0);
        assert_eq!(config.channel_capacity(), 1);
    }
}
