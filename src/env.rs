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

use std::env;
use std::ffi::{OsStr, OsString};
use std::str::FromStr;

/// Settings inherited from the parent build tool.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Env {
    pub(crate) makeflags: OsString,
    pub(crate) debug: i32,
}

impl Env {
    /// Read the environment to get runtime settings.
    pub fn inherit() -> Env {
        let debug = if get_bool("DEBUG_JOBCLIENT_2") {
            2
        } else if get_bool("DEBUG_JOBCLIENT") {
            1
        } else {
            get_int("JOBCLIENT_DEBUG", 0)
        };
        Env {
            makeflags: env::var_os("MAKEFLAGS").unwrap_or_default(),
            debug,
        }
    }

    /// The raw `MAKEFLAGS` value.
    #[inline]
    pub fn makeflags(&self) -> &OsStr {
        &self.makeflags
    }

    #[inline]
    pub fn debug(&self) -> i32 {
        self.debug
    }
}

fn get_int<K: AsRef<OsStr>>(key: K, default: i32) -> i32 {
    env::var(key)
        .ok()
        .and_then(|v| i32::from_str(&v).ok())
        .unwrap_or(default)
}

fn get_bool<K: AsRef<OsStr>>(key: K) -> bool {
    env::var_os(key).map_or(false, |v| !v.is_empty())
}
