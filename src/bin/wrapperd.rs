use std::{os::unix::process::CommandExt, process::Command};

use clap::Parser;

use nodevisor::cli::WrapperArgs;

fn main() {
    let args = WrapperArgs::parse();
    let plan = args.plan();

    // SAFETY: single threaded and about to exec.
    if let Err(err) = unsafe { plan.apply_pre_exec() } {
        eprintln!("wrapperd: failed to sandbox {}: {err}", plan.name);
        std::process::exit(1);
    }

    let (program, rest) = match args.command.split_first() {
        Some(parts) => parts,
        None => {
            eprintln!("wrapperd: no command given for {}", plan.name);
            std::process::exit(1);
        }
    };

    let err = Command::new(program).args(rest).exec();
    eprintln!("wrapperd: failed to exec {program}: {err}");
    std::process::exit(127);
}
