use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use gittuf::attestations::authorization;
use gittuf::git::Oid;

use crate::signer::FileSigner;
use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "attest",
    description: "Create and withdraw reference authorizations",
    usage: r#"
Usage

    gittuf attest authorize <target-ref> <feature-ref> -k <signing-key>
    gittuf attest dismiss --ref <ref> --from <id> --to <id> -k <signing-key>

    `authorize` signs the transition the merge of <feature-ref> into
    <target-ref> is expected to produce. `dismiss` withdraws the
    signer's approval of a previously authorized transition.

Options

    -k, --signing-key <path>   Path to a hex-encoded Ed25519 seed
        --ref <ref>            Reference the authorization speaks about
        --from <id>            State the transition starts from
        --to <id>              Expected merge tree (or tag target)
        --help                 Print help
"#,
};

pub fn run(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut operation: Option<String> = None;
    let mut key_path: Option<PathBuf> = None;
    let mut ref_name: Option<String> = None;
    let mut from: Option<Oid> = None;
    let mut to: Option<Oid> = None;
    let mut values: Vec<String> = Vec::new();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Short('k') | Long("signing-key") => {
                key_path = Some(PathBuf::from(parser.value()?));
            }
            Long("ref") => ref_name = Some(parser.value()?.string()?),
            Long("from") => {
                let value = parser.value()?.string()?;
                from = Some(Oid::from_str(&value).map_err(|e| anyhow!("invalid id: {e}"))?);
            }
            Long("to") => {
                let value = parser.value()?.string()?;
                to = Some(Oid::from_str(&value).map_err(|e| anyhow!("invalid id: {e}"))?);
            }
            Value(value) if operation.is_none() => operation = Some(value.string()?),
            Value(value) => values.push(value.string()?),
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let operation = operation.ok_or_else(|| anyhow!("an operation is required"))?;
    let repo = terminal::repository()?;
    let signer = FileSigner::from_option(key_path.as_deref())?;

    match operation.as_str() {
        "authorize" => {
            let [target_ref, feature_ref] = values.as_slice() else {
                return Err(anyhow!("a target ref and a feature ref are required"));
            };
            let statement = authorization::authorize(&repo, &signer, target_ref, feature_ref)?;
            terminal::info(format_args!(
                "Authorized {} from {} to {}",
                statement.ref_name, statement.from_id, statement.target_id
            ));
        }
        "dismiss" => {
            let ref_name = ref_name.ok_or_else(|| anyhow!("--ref is required"))?;
            let from = from.ok_or_else(|| anyhow!("--from is required"))?;
            let to = to.ok_or_else(|| anyhow!("--to is required"))?;

            authorization::dismiss(&repo, &signer, &ref_name, from, to)?;
            terminal::info(format_args!("Dismissed authorization for {ref_name}"));
        }
        other => return Err(anyhow!("unknown attest operation `{other}`")),
    }
    Ok(())
}
