use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use gittuf::git::Oid;
use gittuf::rsl::{self, AppendOptions};

use crate::signer::FileSigner;
use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "rsl",
    description: "Record and inspect the reference state log",
    usage: r#"
Usage

    gittuf rsl record <ref> [-k <signing-key>] [--skip-duplicate-check]
    gittuf rsl annotate [--skip] -m <message> <entry-id>... [-k <signing-key>]
    gittuf rsl log [-n <count>]
    gittuf rsl skip-invalid <ref> [-k <signing-key>]

Options

    -k, --signing-key <path>     Path to a hex-encoded Ed25519 seed
    -m, --message <text>         Annotation message
    -n, --limit <count>          Limit log output
        --skip                   Mark the annotated entries as skipped
        --skip-duplicate-check   Record even if the entry duplicates
                                 the latest one for the ref
        --help                   Print help
"#,
};

pub fn run(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut operation: Option<String> = None;
    let mut key_path: Option<PathBuf> = None;
    let mut message: Option<String> = None;
    let mut limit: Option<usize> = None;
    let mut skip = false;
    let mut skip_duplicate_check = false;
    let mut values: Vec<String> = Vec::new();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Short('k') | Long("signing-key") => {
                key_path = Some(PathBuf::from(parser.value()?));
            }
            Short('m') | Long("message") => message = Some(parser.value()?.string()?),
            Short('n') | Long("limit") => limit = Some(parser.value()?.parse()?),
            Long("skip") => skip = true,
            Long("skip-duplicate-check") => skip_duplicate_check = true,
            Value(value) if operation.is_none() => operation = Some(value.string()?),
            Value(value) => values.push(value.string()?),
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let operation = operation.ok_or_else(|| anyhow!("an operation is required"))?;
    let repo = terminal::repository()?;

    match operation.as_str() {
        "record" => {
            let ref_name = values
                .first()
                .ok_or_else(|| anyhow!("a reference is required"))?;
            let signer = FileSigner::from_option(key_path.as_deref()).ok();
            let appended = rsl::record(
                &repo,
                ref_name,
                signer.as_ref().map(|s| s as &dyn gittuf::crypto::Signer),
                &AppendOptions {
                    skip_check_for_duplicate: skip_duplicate_check,
                },
            )?;
            match appended {
                rsl::Appended::Written(entry) => {
                    terminal::info(format_args!("Recorded {entry}"))
                }
                rsl::Appended::Unchanged { latest } => terminal::info(format_args!(
                    "State already recorded by {latest}"
                )),
            }
        }
        "annotate" => {
            if values.is_empty() {
                return Err(anyhow!("at least one entry id is required"));
            }
            let entry_ids = values
                .iter()
                .map(|v| Oid::from_str(v).map_err(|e| anyhow!("invalid entry id `{v}`: {e}")))
                .collect::<Result<Vec<_>, _>>()?;
            let signer = FileSigner::from_option(key_path.as_deref()).ok();
            let appended = rsl::annotate(
                &repo,
                entry_ids,
                skip,
                message.ok_or_else(|| anyhow!("--message is required"))?,
                signer.as_ref().map(|s| s as &dyn gittuf::crypto::Signer),
            )?;
            terminal::info(format_args!("Recorded {}", appended.entry()));
        }
        "log" => {
            for entry in rsl::log_entries(&repo, limit)? {
                terminal::info(format_args!("{entry}"));
            }
        }
        "skip-invalid" => {
            let ref_name = values
                .first()
                .ok_or_else(|| anyhow!("a reference is required"))?;
            let signer = FileSigner::from_option(key_path.as_deref()).ok();
            match rsl::skip_invalid(
                &repo,
                ref_name,
                signer.as_ref().map(|s| s as &dyn gittuf::crypto::Signer),
            )? {
                Some(entry) => terminal::info(format_args!("Recorded {entry}")),
                None => terminal::info("No invalid entries found"),
            }
        }
        other => return Err(anyhow!("unknown rsl operation `{other}`")),
    }
    Ok(())
}
