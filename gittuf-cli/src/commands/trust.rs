use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context as _};
use gittuf::crypto::hash::Digest;
use gittuf::crypto::{Key, PublicKey};
use gittuf::hooks::{Environment, HashAlgorithm, Hook, Stage};
use gittuf::policy;
use gittuf::storage::WriteRepository as _;
use gittuf::tuf::principal::Principal;
use gittuf::tuf::root::{GlobalRule, PropagationDirective, RepositoryRef};

use crate::signer::FileSigner;
use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "trust",
    description: "Edit the staged root of trust",
    usage: r#"
Usage

    gittuf trust <operation> [<option>...] -k <signing-key>

    Operations edit the staged root metadata and re-sign it with the
    given key. Promote with `gittuf policy apply`.

Operations

    add-root-key --key <pubkey>
    remove-root-key --key-id <id>
    add-policy-key --key <pubkey>
    remove-policy-key --key-id <id>
    set-root-threshold --threshold <n>
    set-policy-threshold --threshold <n>
    add-github-app [--app-name <name>] --key <pubkey>
    remove-github-app [--app-name <name>]
    enable-github-app-approvals [--app-name <name>]
    disable-github-app-approvals [--app-name <name>]
    add-global-rule --kind threshold --name <name> --path <pattern>.. --threshold <n>
    add-global-rule --kind block-force-push --name <name> --path <pattern>..
    remove-global-rule --name <name>
    add-propagation-directive --name <name> --upstream-repository <url>
        --upstream-ref <ref> --upstream-path <path>
        --downstream-ref <ref> --downstream-path <path>
    remove-propagation-directive --name <name>
    add-controller-repository --name <name> --location <url>
    add-network-repository --name <name> --location <url>
    add-hook --stage <pre-commit|pre-push> --name <name> --file <path>
        [--principal <id>].. [--timeout <seconds>] [--force]
    remove-hook --stage <stage> --name <name>
    sign

Options

    -k, --signing-key <path>   Path to a hex-encoded Ed25519 seed
        --help                 Print help

Keys are given in did:key form (z6Mk...).
"#,
};

#[derive(Default)]
struct Options {
    key_path: Option<PathBuf>,
    key: Option<PublicKey>,
    key_id: Option<String>,
    app_name: Option<String>,
    name: Option<String>,
    kind: Option<String>,
    paths: Vec<String>,
    threshold: Option<usize>,
    upstream_repository: Option<String>,
    upstream_ref: Option<String>,
    upstream_path: Option<String>,
    downstream_ref: Option<String>,
    downstream_path: Option<String>,
    location: Option<String>,
    stage: Option<Stage>,
    file: Option<PathBuf>,
    principals: Vec<String>,
    timeout: Option<u64>,
    force: bool,
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
            Long("key-id") => opts.key_id = Some(parser.value()?.string()?),
            Long("app-name") => opts.app_name = Some(parser.value()?.string()?),
            Long("name") => opts.name = Some(parser.value()?.string()?),
            Long("kind") => opts.kind = Some(parser.value()?.string()?),
            Long("path") => opts.paths.push(parser.value()?.string()?),
            Long("threshold") => opts.threshold = Some(parser.value()?.parse()?),
            Long("upstream-repository") => {
                opts.upstream_repository = Some(parser.value()?.string()?)
            }
            Long("upstream-ref") => opts.upstream_ref = Some(parser.value()?.string()?),
            Long("upstream-path") => opts.upstream_path = Some(parser.value()?.string()?),
            Long("downstream-ref") => opts.downstream_ref = Some(parser.value()?.string()?),
            Long("downstream-path") => opts.downstream_path = Some(parser.value()?.string()?),
            Long("location") => opts.location = Some(parser.value()?.string()?),
            Long("stage") => {
                let value = parser.value()?.string()?;
                opts.stage = Some(match value.as_str() {
                    "pre-commit" => Stage::PreCommit,
                    "pre-push" => Stage::PrePush,
                    other => return Err(anyhow!("unknown hook stage `{other}`")),
                });
            }
            Long("file") => opts.file = Some(PathBuf::from(parser.value()?)),
            Long("principal") => opts.principals.push(parser.value()?.string()?),
            Long("timeout") => opts.timeout = Some(parser.value()?.parse()?),
            Long("force") => opts.force = true,
            Value(value) if operation.is_none() => {
                operation = Some(value.string()?);
            }
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let operation = operation.ok_or_else(|| anyhow!("an operation is required"))?;

    let repo = terminal::repository()?;
    let signer = FileSigner::from_option(opts.key_path.as_deref())?;
    let mut staged = policy::load_staging(&repo)
        .context("No staged policy; run `gittuf init` first")?;

    if operation == "sign" {
        staged.sign_root(&signer)?;
        policy::stage(&repo, &staged, "Sign root metadata")?;
        terminal::info("Signed root metadata");
        return Ok(());
    }

    let mut root = staged.root.clone();
    let message = match operation.as_str() {
        "add-root-key" => {
            let key = opts.key.ok_or_else(|| anyhow!("--key is required"))?;
            root.add_root_principal(Principal::Key(Key::ed25519(key)));
            "Add root key"
        }
        "remove-root-key" => {
            let id = opts.key_id.ok_or_else(|| anyhow!("--key-id is required"))?;
            root.remove_root_principal(&id)?;
            "Remove root key"
        }
        "add-policy-key" => {
            let key = opts.key.ok_or_else(|| anyhow!("--key is required"))?;
            root.add_primary_rule_principal(Principal::Key(Key::ed25519(key)));
            "Add policy key"
        }
        "remove-policy-key" => {
            let id = opts.key_id.ok_or_else(|| anyhow!("--key-id is required"))?;
            root.remove_primary_rule_principal(&id)?;
            "Remove policy key"
        }
        "set-root-threshold" => {
            let threshold = opts
                .threshold
                .ok_or_else(|| anyhow!("--threshold is required"))?;
            root.set_root_threshold(threshold)?;
            "Update root threshold"
        }
        "set-policy-threshold" => {
            let threshold = opts
                .threshold
                .ok_or_else(|| anyhow!("--threshold is required"))?;
            root.set_primary_rule_threshold(threshold)?;
            "Update policy threshold"
        }
        "add-github-app" => {
            let key = opts.key.ok_or_else(|| anyhow!("--key is required"))?;
            root.add_github_app(
                opts.app_name.as_deref(),
                Principal::Key(Key::ed25519(key)),
            );
            "Add GitHub app"
        }
        "remove-github-app" => {
            root.remove_github_app(opts.app_name.as_deref())?;
            "Remove GitHub app"
        }
        "enable-github-app-approvals" => {
            root.set_github_app_trust(opts.app_name.as_deref(), true)?;
            "Enable GitHub app approvals"
        }
        "disable-github-app-approvals" => {
            root.set_github_app_trust(opts.app_name.as_deref(), false)?;
            "Disable GitHub app approvals"
        }
        "add-global-rule" => {
            let name = opts.name.ok_or_else(|| anyhow!("--name is required"))?;
            let paths = nonempty::NonEmpty::from_vec(opts.paths.clone())
                .ok_or_else(|| anyhow!("at least one --path is required"))?;
            let rule = match opts.kind.as_deref() {
                Some("threshold") => GlobalRule::Threshold {
                    name,
                    paths,
                    threshold: opts
                        .threshold
                        .ok_or_else(|| anyhow!("--threshold is required"))?,
                },
                Some("block-force-push") => GlobalRule::BlockForcePush { name, paths },
                _ => return Err(anyhow!("--kind must be threshold or block-force-push")),
            };
            root.add_global_rule(rule)?;
            "Add global rule"
        }
        "remove-global-rule" => {
            let name = opts.name.ok_or_else(|| anyhow!("--name is required"))?;
            root.remove_global_rule(&name)?;
            "Remove global rule"
        }
        "add-propagation-directive" => {
            let directive = PropagationDirective {
                name: opts.name.ok_or_else(|| anyhow!("--name is required"))?,
                upstream_repository: opts
                    .upstream_repository
                    .ok_or_else(|| anyhow!("--upstream-repository is required"))?,
                upstream_ref: opts
                    .upstream_ref
                    .ok_or_else(|| anyhow!("--upstream-ref is required"))?,
                upstream_path: opts.upstream_path.unwrap_or_default(),
                downstream_ref: opts
                    .downstream_ref
                    .ok_or_else(|| anyhow!("--downstream-ref is required"))?,
                downstream_path: opts
                    .downstream_path
                    .ok_or_else(|| anyhow!("--downstream-path is required"))?,
            };
            root.add_propagation_directive(directive);
            "Add propagation directive"
        }
        "remove-propagation-directive" => {
            let name = opts.name.ok_or_else(|| anyhow!("--name is required"))?;
            root.remove_propagation_directive(&name)?;
            "Remove propagation directive"
        }
        "add-controller-repository" => {
            root.controller_repositories.push(RepositoryRef {
                name: opts.name.ok_or_else(|| anyhow!("--name is required"))?,
                location: opts
                    .location
                    .ok_or_else(|| anyhow!("--location is required"))?,
            });
            "Add controller repository"
        }
        "add-network-repository" => {
            root.network_repositories.push(RepositoryRef {
                name: opts.name.ok_or_else(|| anyhow!("--name is required"))?,
                location: opts
                    .location
                    .ok_or_else(|| anyhow!("--location is required"))?,
            });
            "Add network repository"
        }
        "add-hook" => {
            let stage = opts.stage.ok_or_else(|| anyhow!("--stage is required"))?;
            let file = opts.file.ok_or_else(|| anyhow!("--file is required"))?;
            let source = std::fs::read(&file)
                .with_context(|| format!("Cannot read hook source {}", file.display()))?;
            let blob_id = repo.write_blob(&source)?;
            let hook = Hook {
                name: opts.name.ok_or_else(|| anyhow!("--name is required"))?,
                principal_ids: opts.principals.iter().cloned().collect(),
                blob_id,
                hashes: BTreeMap::from_iter([(HashAlgorithm::Sha256, Digest::new(&source))]),
                environment: Environment::Lua,
                timeout: opts.timeout.unwrap_or(30),
            };
            root.add_hook(stage, hook, opts.force)?;
            "Add hook"
        }
        "remove-hook" => {
            let stage = opts.stage.ok_or_else(|| anyhow!("--stage is required"))?;
            let name = opts.name.ok_or_else(|| anyhow!("--name is required"))?;
            root.remove_hook(stage, &name)?;
            "Remove hook"
        }
        other => return Err(anyhow!("unknown trust operation `{other}`")),
    };

    staged.set_root(root, &signer)?;
    policy::stage(&repo, &staged, message)?;
    terminal::info(format_args!("{message}: staged"));
    Ok(())
}
