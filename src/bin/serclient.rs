#![deny(unsafe_code)]

use std::{env, process::ExitCode};

fn main() -> ExitCode {
    agent::run(env::args_os())
}
