use std::ffi::OsString;
use std::process;

mod commands;
mod logger;
mod signer;
mod terminal;

use terminal::args::Help;

pub const COMMANDS: &[Help] = &[
    commands::attest::HELP,
    commands::clone::HELP,
    commands::init::HELP,
    commands::policy::HELP,
    commands::rsl::HELP,
    commands::sync::HELP,
    commands::trust::HELP,
    commands::verify::HELP,
];

fn print_help() {
    println!("gittuf {}", env!("CARGO_PKG_VERSION"));
    println!("A verifiable policy and audit log for Git repositories");
    println!();
    println!("Usage: gittuf <command> [<option>...]");
    println!();
    println!("Commands:");
    for help in COMMANDS {
        println!("    {:<18} {}", help.name, help.description);
    }
    println!();
    println!("Run `gittuf <command> --help` for command details.");
}

fn main() {
    logger::init();

    let mut args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let Some(command) = args.first().and_then(|c| c.to_str().map(str::to_owned)) else {
        print_help();
        process::exit(2);
    };
    args.remove(0);

    let result = match command.as_str() {
        "attest" => commands::attest::run(args),
        "clone" => commands::clone::run(args),
        "init" => commands::init::run(args),
        "policy" => commands::policy::run(args),
        "rsl" => commands::rsl::run(args),
        "sync" => commands::sync::run(args),
        "trust" => commands::trust::run(args),
        "verify-ref" => commands::verify::run_ref(args),
        "verify-mergeable" => commands::verify::run_mergeable(args),
        "help" | "--help" | "-h" => {
            print_help();
            return;
        }
        "--version" | "version" => {
            println!("gittuf {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        other => {
            eprintln!("gittuf: unknown command `{other}`");
            process::exit(2);
        }
    };

    match result {
        Ok(()) => {}
        Err(err) => {
            if let Some(help) = err.downcast_ref::<Help>() {
                println!("{}", help.usage);
                return;
            }
            eprintln!("gittuf: error: {err:#}");
            process::exit(terminal::exit_code(&err));
        }
    }
}
