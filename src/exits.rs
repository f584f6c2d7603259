// Copyright 2021 Ross Light
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Process exit codes used by jobserver-aware programs.

use super::error::JobserverErrorKind;

/// Success exit code.
pub const EXIT_SUCCESS: i32 = 0;

/// Generic failure exit code.
pub const EXIT_FAILURE: i32 = 1;

/// `MAKEFLAGS` could not be parsed.
pub const EXIT_BAD_MAKEFLAGS: i32 = 2;

/// `MAKEFLAGS` named descriptors that were not passed down, usually because
/// the make rule was not marked as recursive.
pub const EXIT_NOT_RECURSIVE: i32 = 200;

impl From<&JobserverErrorKind> for i32 {
    fn from(kind: &JobserverErrorKind) -> i32 {
        match kind {
            JobserverErrorKind::BadMakeflags => EXIT_BAD_MAKEFLAGS,
            JobserverErrorKind::NotRecursiveMake => EXIT_NOT_RECURSIVE,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_kind() {
        assert_eq!(i32::from(&JobserverErrorKind::BadMakeflags), 2);
        assert_eq!(i32::from(&JobserverErrorKind::NotRecursiveMake), 200);
        assert_eq!(i32::from(&JobserverErrorKind::Generic), EXIT_FAILURE);
        assert_eq!(
            i32::from(&JobserverErrorKind::ChildHoldingTokens { outstanding: 1 }),
            EXIT_FAILURE
        );
    }
}
