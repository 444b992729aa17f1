use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context as _};
use gittuf::crypto::{Key, PublicKey};
use gittuf::policy::{self, LoadOptions};
use gittuf::tuf::principal::Principal;
use gittuf::tuf::targets::{Rule, TargetsMetadata};
use gittuf::tuf::TARGETS_ROLE;

use crate::signer::FileSigner;
use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "policy",
    description: "Edit, inspect and apply rule files",
    usage: r#"
Usage

    gittuf policy <operation> [<option>...] -k <signing-key>

Operations

    apply                       Promote the staged policy
    discard                     Reset staging to the applied policy
    list-rules                  Print the rules in effect
    list-principals             Print the principals in effect
    add-key --key <pubkey> [--rule-file <name>]
    add-rule --name <name> --path <pattern>.. --authorize <principal>..
        [--threshold <n>] [--terminating] [--rule-file <name>]
    remove-rule --name <name> [--rule-file <name>]
    sign [--rule-file <name>]

Options

    -k, --signing-key <path>    Path to a hex-encoded Ed25519 seed
        --help                  Print help

Without --rule-file, operations edit the primary rule file.
"#,
};

#[derive(Default)]
struct Options {
    key_path: Option<PathBuf>,
    key: Option<PublicKey>,
    name: Option<String>,
    paths: Vec<String>,
    authorize: Vec<String>,
    threshold: Option<usize>,
    terminating: bool,
    rule_file: Option<String>,
}

pub fn run(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut operation: Option<String> = None;
    let mut opts = Options::default();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Short('k') | Long("signing-key") => {
                opts.key_path = Some(PathBuf::from(parser.value()?));
            }
            Long("key") => {
                let value = parser.value()?.string()?;
                opts.key = Some(
                    PublicKey::from_str(&value)
                        .map_err(|e| anyhow!("invalid public key: {e}"))?,
                );
            }
            Long("name") => opts.name = Some(parser.value()?.string()?),
            Long("path") => opts.paths.push(parser.value()?.string()?),
            Long("authorize") => opts.authorize.push(parser.value()?.string()?),
            Long("threshold") => opts.threshold = Some(parser.value()?.parse()?),
            Long("terminating") => opts.terminating = true,
            Long("rule-file") => opts.rule_file = Some(parser.value()?.string()?),
            Value(value) if operation.is_none() => {
                operation = Some(value.string()?);
            }
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let operation = operation.ok_or_else(|| anyhow!("an operation is required"))?;
    let repo = terminal::repository()?;

    match operation.as_str() {
        "apply" => {
            let entry = policy::apply(&repo, None)?;
            terminal::info(format_args!("Applied policy; log entry {}", entry.id));
            return Ok(());
        }
        "discard" => {
            policy::discard(&repo)?;
            terminal::info("Discarded staged policy changes");
            return Ok(());
        }
        "list-rules" => {
            let state = policy::load(&repo, &gittuf::POLICY_REF, &LoadOptions::default(), None)?
                .context("No applied policy")?;
            list_rules(&state);
            return Ok(());
        }
        "list-principals" => {
            let state = policy::load(&repo, &gittuf::POLICY_REF, &LoadOptions::default(), None)?
                .context("No applied policy")?;
            list_principals(&state);
            return Ok(());
        }
        _ => {}
    }

    // The remaining operations edit staged rule files.
    let signer = FileSigner::from_option(opts.key_path.as_deref())?;
    let mut staged = policy::load_staging(&repo)
        .context("No staged policy; run `gittuf init` first")?;
    let file_name = opts.rule_file.as_deref().unwrap_or(TARGETS_ROLE);
    let mut targets = current_file(&staged, file_name);

    let message = match operation.as_str() {
        "add-key" => {
            let key = opts.key.ok_or_else(|| anyhow!("--key is required"))?;
            targets.add_principal(Principal::Key(Key::ed25519(key)))?;
            "Add principal to rule file"
        }
        "add-rule" => {
            let paths = nonempty::NonEmpty::from_vec(opts.paths.clone())
                .ok_or_else(|| anyhow!("at least one --path is required"))?;
            let principal_ids: BTreeSet<String> = opts.authorize.iter().cloned().collect();
            if principal_ids.is_empty() {
                return Err(anyhow!("at least one --authorize is required"));
            }
            targets.add_rule(Rule {
                name: opts.name.ok_or_else(|| anyhow!("--name is required"))?,
                paths,
                threshold: opts.threshold.unwrap_or(1),
                principal_ids,
                terminating: opts.terminating,
            })?;
            "Add rule"
        }
        "remove-rule" => {
            let name = opts.name.ok_or_else(|| anyhow!("--name is required"))?;
            targets.remove_rule(&name)?;
            "Remove rule"
        }
        "sign" => {
            if file_name == TARGETS_ROLE {
                staged.sign_targets(&signer)?;
            } else {
                let mut envelope = staged
                    .delegation_envelopes
                    .get(file_name)
                    .cloned()
                    .context("No such rule file")?;
                envelope.resign(&signer)?;
                staged
                    .delegation_envelopes
                    .insert(file_name.to_owned(), envelope);
            }
            policy::stage(&repo, &staged, "Sign rule file")?;
            terminal::info("Signed rule file");
            return Ok(());
        }
        other => return Err(anyhow!("unknown policy operation `{other}`")),
    };

    if file_name == TARGETS_ROLE {
        staged.set_targets(targets, &signer)?;
    } else {
        staged.set_delegation(file_name, targets, &signer)?;
    }
    policy::stage(&repo, &staged, message)?;
    terminal::info(format_args!("{message}: staged"));
    Ok(())
}

fn current_file(staged: &policy::PolicyState, name: &str) -> TargetsMetadata {
    if name == TARGETS_ROLE {
        staged.targets.clone().unwrap_or_default()
    } else {
        staged
            .delegation(name)
            .cloned()
            .unwrap_or_default()
    }
}

fn list_rules(state: &policy::PolicyState) {
    let Some(targets) = &state.targets else {
        terminal::info("No rule file in the applied policy");
        return;
    };
    print_rules(TARGETS_ROLE, targets);
    for (name, file) in &state.delegations {
        print_rules(name, file);
    }
}

fn print_rules(file_name: &str, file: &TargetsMetadata) {
    terminal::info(format_args!("{file_name}:"));
    for rule in &file.rules {
        if rule.is_allow() {
            continue;
        }
        terminal::info(format_args!(
            "    {} ({} of {}) {} {}",
            rule.name,
            rule.threshold,
            rule.principal_ids.len(),
            rule.paths.iter().cloned().collect::<Vec<_>>().join(", "),
            if rule.terminating { "[terminating]" } else { "" },
        ));
    }
}

fn list_principals(state: &policy::PolicyState) {
    let mut print = |file_name: &str, file: &TargetsMetadata| {
        terminal::info(format_args!("{file_name}:"));
        for principal in file.principals.values() {
            terminal::info(format_args!("    {}", principal.id()));
        }
    };
    if let Some(targets) = &state.targets {
        print(TARGETS_ROLE, targets);
    }
    for (name, file) in &state.delegations {
        print(name, file);
    }
}
