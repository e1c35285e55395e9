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

use thiserror::Error;

use protocol::deployment::DeploymentState;

/// Process exit codes are the sole contract with the CI host. The numbering
/// is stable and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Failure = 1,
    InvocationFailure = 2,
    InternalError = 3,
    Timeout = 4,
    NoDeployment = 5,
    Unavailable = 6,
    TemplateError = 7,
}

impl ExitCode {
    /// Map a terminal deployment state to the code reported to the host.
    pub fn from_terminal_state(state: DeploymentState) -> ExitCode {
        match state {
            DeploymentState::Success => ExitCode::Success,
            DeploymentState::Failure => ExitCode::Failure,
            _ => ExitCode::InternalError,
        }
    }
}

#[derive(Error, Debug)]
#[error("{message}")]
pub struct Error {
    pub exit_code: ExitCode,
    pub message: String,
}

impl Error {
    pub fn new(exit_code: ExitCode, message: impl Into<String>) -> Self {
        Error {
            exit_code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::Failure as i32, 1);
        assert_eq!(ExitCode::InvocationFailure as i32, 2);
        assert_eq!(ExitCode::InternalError as i32, 3);
        assert_eq!(ExitCode::Timeout as i32, 4);
        assert_eq!(ExitCode::NoDeployment as i32, 5);
        assert_eq!(ExitCode::Unavailable as i32, 6);
        assert_eq!(ExitCode::TemplateError as i32, 7);
    }

    #[test]
    fn terminal_states_map_to_their_codes() {
        assert_eq!(
            ExitCode::from_terminal_state(DeploymentState::Success),
            ExitCode::Success
        );
        assert_eq!(
            ExitCode::from_terminal_state(DeploymentState::Failure),
            ExitCode::Failure
        );
        assert_eq!(
            ExitCode::from_terminal_state(DeploymentState::Error),
            ExitCode::InternalError
        );
    }
}
