use std::ffi::OsString;
use std::str::FromStr;

use anyhow::anyhow;
use gittuf::git::Oid;
use gittuf::verify::{self, VerifyOptions};

use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "verify-ref",
    description: "Verify a reference against the log and policy",
    usage: r#"
Usage

    gittuf verify-ref <ref> [<option>...]
    gittuf verify-mergeable <target-ref> <feature-ref>

Options

    --latest-only          Verify only the newest entry for the ref
    --from-entry <id>      Verify starting at the given entry
    --help                 Print help
"#,
};

pub fn run_ref(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut ref_name: Option<String> = None;
    let mut opts = VerifyOptions::default();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Long("latest-only") => opts.latest_only = true,
            Long("from-entry") => {
                let value = parser.value()?.string()?;
                opts.from_entry =
                    Some(Oid::from_str(&value).map_err(|e| anyhow!("invalid entry id: {e}"))?);
            }
            Value(value) if ref_name.is_none() => {
                ref_name = Some(value.string()?);
            }
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let ref_name = ref_name.ok_or_else(|| anyhow!("a reference is required"))?;
    let ref_name = gittuf::git::qualify_branch(&ref_name);
    let repo = terminal::repository()?;

    let report = verify::verify_ref(&repo, &ref_name, &opts)?;

    terminal::info(format_args!(
        "Verified {} entries for {}",
        report.entries.len(),
        report.ref_name
    ));
    for entry in &report.entries {
        for outcome in &entry.satisfied {
            terminal::info(format_args!(
                "    entry {:.7}: rule {} satisfied by {}",
                entry.entry_id,
                outcome.rule_name,
                outcome.approvers.join(", ")
            ));
        }
    }
    terminal::info(format_args!("Expected tip: {}", report.expected_tip));
    Ok(())
}

pub fn run_mergeable(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut refs: Vec<String> = Vec::new();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Value(value) => refs.push(value.string()?),
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let [target_ref, feature_ref] = refs.as_slice() else {
        return Err(anyhow!("a target ref and a feature ref are required"));
    };
    let target_ref = gittuf::git::qualify_branch(target_ref);
    let feature_ref = gittuf::git::qualify_branch(feature_ref);
    let repo = terminal::repository()?;

    let mergeable = verify::verify_mergeable(
        &repo,
        &target_ref,
        &feature_ref,
        &VerifyOptions::default(),
    )?;

    if mergeable.ok {
        if mergeable.needs_rsl_signature {
            terminal::info(
                "Mergeable: the log entry for the merge must be signed by a qualified approver",
            );
        } else {
            terminal::info("Mergeable");
        }
        Ok(())
    } else {
        Err(anyhow!(
            "not mergeable: required approvals are missing for {target_ref}"
        ))
    }
}
