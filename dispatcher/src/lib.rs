/*
Copyright 2024 The Convoy Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

pub mod config;
pub mod deploy_service;
pub mod dispatch_service;
pub mod router;
pub mod store;

pub use deploy_service::DeployService;
pub use dispatch_service::DispatchService;
pub use router::Router;
pub use store::{DeploymentStore, InMemoryStore};

/// Message returned to callers whenever the persistence layer fails; the
/// condition is retryable.
pub const ERR_DATABASE_UNAVAILABLE: &str = "database is unavailable; try again later";
