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

use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use super::error::{ErrorKind, JobClientError};

/// One unit of concurrency taken from the pool.
///
/// The byte itself carries no meaning: any token may be released no matter
/// which acquire produced it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Token(u8);

impl Token {
    #[inline]
    pub const fn new(value: u8) -> Token {
        Token(value)
    }

    #[inline]
    pub const fn value(self) -> u8 {
        self.0
    }
}

/// The `'+'` byte GNU make fills its pool with.
impl Default for Token {
    #[inline]
    fn default() -> Token {
        Token(b'+')
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<u8> for Token {
    #[inline]
    fn from(value: u8) -> Token {
        Token(value)
    }
}

impl From<Token> for u8 {
    #[inline]
    fn from(token: Token) -> u8 {
        token.0
    }
}

impl TryFrom<i64> for Token {
    type Error = JobClientError;

    fn try_from(value: i64) -> Result<Token, JobClientError> {
        u8::try_from(value).map(Token).map_err(|_| JobClientError {
            kind: ErrorKind::InvalidToken,
            msg: format!("invalid token {}: must be in 0..=255", value),
        })
    }
}

impl TryFrom<i32> for Token {
    type Error = JobClientError;

    #[inline]
    fn try_from(value: i32) -> Result<Token, JobClientError> {
        Token::try_from(i64::from(value))
    }
}

impl FromStr for Token {
    type Err = JobClientError;

    fn from_str(s: &str) -> Result<Token, JobClientError> {
        match s.trim().parse::<i64>() {
            Ok(n) => Token::try_from(n),
            Err(_) => Err(JobClientError {
                kind: ErrorKind::InvalidToken,
                msg: format!("invalid token {:?}: not an integer", s),
            }),
        }
    }
}
