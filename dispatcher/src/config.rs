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

use std::collections::HashMap;
use std::net::SocketAddr;

use clap::Parser;

#[derive(Debug, Parser)]
pub struct Config {
    /// Address the gRPC server binds to.
    #[clap(long, default_value = "0.0.0.0:9090")]
    pub listen_address: SocketAddr,

    /// Cluster rewrite applied on admission, `from=to`. May be repeated.
    #[clap(long = "redirect", value_parser = parse_redirect)]
    pub redirects: Vec<(String, String)>,
}

impl Config {
    pub fn redirect_map(&self) -> HashMap<String, String> {
        self.redirects.iter().cloned().collect()
    }
}

fn parse_redirect(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => {
            Ok((from.to_string(), to.to_string()))
        }
        _ => Err(format!("expected 'from=to', got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_parses_pairs() {
        assert_eq!(
            parse_redirect("dev=dev-gcp").unwrap(),
            ("dev".to_string(), "dev-gcp".to_string())
        );
        assert!(parse_redirect("dev").is_err());
        assert!(parse_redirect("=x").is_err());
    }
}
