use std::ffi::OsString;

use anyhow::anyhow;
use gittuf::sync::{self, SyncOptions};

use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "sync",
    description: "Reconcile the local log with a remote",
    usage: r#"
Usage

    gittuf sync <remote> [<option>...]

Options

    --overwrite-local-refs   Let the remote state win for diverged refs
    --help                   Print help
"#,
};

pub fn run(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut remote: Option<String> = None;
    let mut opts = SyncOptions::default();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Long("overwrite-local-refs") => opts.overwrite_local_refs = true,
            Value(value) if remote.is_none() => remote = Some(value.string()?),
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let remote = remote.unwrap_or_else(|| "origin".to_owned());
    let repo = terminal::repository()?;

    let report = sync::reconcile(&repo, &remote, &opts)?;

    match report.action {
        sync::Action::UpToDate => terminal::info("Already up to date"),
        sync::Action::FastForwarded => terminal::info("Fast-forwarded local log"),
        sync::Action::Pushed => terminal::info("Pushed local log"),
        sync::Action::Reconciled => terminal::info("Reconciled diverged logs"),
    }
    for name in &report.updated_refs {
        terminal::info(format_args!("    updated {name}"));
    }
    for name in &report.diverged_refs {
        terminal::info(format_args!("    diverged {name}"));
    }
    if !report.diverged_refs.is_empty() {
        return Err(anyhow!(
            "{} refs diverged; re-run with --overwrite-local-refs to take the remote state",
            report.diverged_refs.len()
        ));
    }
    Ok(())
}
