// Copyright 2020 The Matrix.org Foundation C.I.C.
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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod config;
mod directory;
mod error;
pub mod events;
mod flow;
mod identifiers;
mod manager;
mod registry;

#[cfg(any(test, feature = "testing"))]
/// Testing facilities and helpers for verification manager tests
pub mod test_utils;

pub use config::VerificationManagerConfig;
pub use directory::{RoomDirectory, RoomInfo};
pub use error::{DirectoryError, EventError, VerificationError};
pub use flow::{FlowFactory, VerificationFlow};
pub use identifiers::FlowId;
pub use manager::{VerificationManager, VerificationNotice};

#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
