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

//! Exercise the jobserver of an enclosing `make -jN`.
//!
//! Acquires as many tokens as the build should have spare, checks that one
//! more can't be had, then gives everything back.

use anyhow::{anyhow, Context, Error};
use clap::{crate_version, App, Arg, ArgMatches};
use std::io;
use std::process;
use std::str::FromStr;
use std::time::Duration;

use jobclient::logs::LogBuilder;
use jobclient::{
    log_err, log_warn, Env, ErrorKind, JobClient, EXIT_FAILURE, EXIT_INVALID_JOBSERVER,
    EXIT_SUCCESS,
};

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            let msg = {
                use std::fmt::Write;

                let mut s = String::new();
                for e in e.chain() {
                    if !s.is_empty() {
                        write!(s, ": ").unwrap();
                    }
                    write!(s, "{}", e).unwrap();
                }
                s
            };
            log_err!("{}", msg);
            let retcode = match ErrorKind::of(&e) {
                ErrorKind::NoJobServer => EXIT_INVALID_JOBSERVER,
                _ => EXIT_FAILURE,
            };
            process::exit(retcode)
        }
    }
}

fn run() -> Result<i32, Error> {
    let matches = App::new("jobclient")
        .version(crate_version!())
        .about("Acquire and release tokens from the enclosing make jobserver")
        .arg(Arg::from_usage(
            "-j, --max-jobs=[N] 'override the job limit from MAKEFLAGS'",
        ))
        .arg(Arg::from_usage(
            "-l, --max-load=[N] 'override the load limit from MAKEFLAGS'",
        ))
        .arg(Arg::from_usage(
            "--timeout-ms=[MS] 'longest wait for a single token (default: 100)'",
        ))
        .arg(Arg::from_usage(
            "-n, --count=[N] 'tokens to acquire when the job limit is unknown (default: 1)'",
        ))
        .arg(
            Arg::from_usage("--fifo [PATH]... 'read and write ends of the pool as paths'")
                .number_of_values(2)
                .value_names(&["READ", "WRITE"]),
        )
        .arg(Arg::from_usage(
            "--require 'fail instead of succeeding when there is no jobserver'",
        ))
        .arg(Arg::from_usage(
            "-d, --debug... 'print jobserver traffic as it happens (twice for more)'",
        ))
        .get_matches();

    let env = Env::inherit();
    let mut log_builder = LogBuilder::new();
    {
        let n = matches.occurrences_of("debug");
        if n > 0 {
            log_builder.debug(n as i32);
        }
    }
    log_builder.setup(&env, io::stderr());

    let mut builder = JobClient::builder();
    if let Some(n) = parse_arg::<u32>(&matches, "max-jobs")? {
        builder.max_jobs(n);
    }
    if let Some(n) = parse_arg::<u32>(&matches, "max-load")? {
        builder.max_load(n);
    }
    if let Some(ms) = parse_arg::<u64>(&matches, "timeout-ms")? {
        builder.read_timeout(Duration::from_millis(ms));
    }
    if let Some(mut paths) = matches.values_of_os("fifo") {
        match (paths.next(), paths.next()) {
            (Some(read), Some(write)) => {
                builder.named_pipes(read, write);
            }
            _ => return Err(anyhow!("--fifo needs a read path and a write path")),
        }
    }
    let count = parse_arg::<u32>(&matches, "count")?.unwrap_or(1);

    let mut client = match builder.build() {
        Ok(client) => client,
        Err(e) if e.is_no_job_server() && !matches.is_present("require") => {
            println!("jobclient: init failed: {}", e);
            return Ok(EXIT_SUCCESS);
        }
        Err(e) => return Err(Error::new(e).context("connect to jobserver")),
    };
    println!("jobclient: init ok");
    println!("jobclient: maxJobs = {}", display_limit(client.max_jobs()));
    println!("jobclient: maxLoad = {}", display_limit(client.max_load()));

    // Make already counts this process as one job.
    let want = client.max_jobs().map_or(count, |n| n.saturating_sub(1));
    let mut tokens = Vec::new();
    println!("jobclient: acquire {} tokens ...", want);
    for i in 0..want {
        match client.acquire().context("acquire")? {
            Some(token) => {
                tokens.push(token);
                println!(
                    "jobclient: token {} of {}: got {}",
                    i + 1,
                    want,
                    token
                );
            }
            None => {
                println!("jobclient: jobserver is full after {} tokens", i);
                break;
            }
        }
    }

    let mut code = EXIT_SUCCESS;
    match client.acquire().context("acquire excess token")? {
        None => println!("jobclient: acquire excess token failed = ok"),
        Some(token) => {
            if client.max_jobs().is_some() && tokens.len() as u32 == want {
                log_warn!("acquired more than maxJobs - 1 tokens");
                code = EXIT_FAILURE;
            }
            println!("jobclient: acquire excess token ok (token {})", token);
            tokens.push(token);
        }
    }

    println!("jobclient: release {} tokens ...", tokens.len());
    while let Some(token) = tokens.pop() {
        client.release(token).context("release")?;
    }
    println!("jobclient: done");
    Ok(code)
}

fn parse_arg<T>(matches: &ArgMatches, name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    matches
        .value_of(name)
        .map(|v| {
            v.parse::<T>()
                .with_context(|| format!("invalid --{} value: {}", name, v))
        })
        .transpose()
}

fn display_limit(limit: Option<u32>) -> String {
    limit.map_or_else(|| String::from("unknown"), |n| n.to_string())
}
