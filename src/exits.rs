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

/// Success exit code.
pub const EXIT_SUCCESS: i32 = 0;

/// Generic failure exit code.
pub const EXIT_FAILURE: i32 = 1;

/// A jobserver was required but `MAKEFLAGS` did not name a usable one.
pub const EXIT_INVALID_JOBSERVER: i32 = 200;
