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

use clap::Parser;

#[derive(Debug, Parser)]
pub struct Config {
    /// Cluster label this agent serves; the dispatcher keeps one active
    /// agent per label.
    #[clap(long)]
    pub cluster: String,

    /// Endpoint of the dispatcher's gRPC server.
    #[clap(long, default_value = "http://localhost:9090")]
    pub dispatcher_url: String,
}
