// Copyright 2025 coScene
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

// Storage module
//
// Trait-based abstraction over where segments and snapshots land, so the
// recorder and detector can be exercised against failing stores in tests.
//
// Every write goes to a hidden ".part" file that is renamed into place once
// complete. Readers (catalog, retention) only ever see finished artifacts.

pub mod backend;
pub mod filesystem;

pub use backend::{SegmentSink, SegmentStore, SnapshotDraft, SnapshotStore};
pub use filesystem::{FilesystemSegmentStore, FilesystemSnapshotStore};
