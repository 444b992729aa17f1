use std::ffi::OsString;
use std::path::PathBuf;

use gittuf::crypto::{Key, Signer as _};
use gittuf::policy;
use gittuf::tuf::principal::Principal;
use gittuf::tuf::root::RootMetadata;

use crate::signer::FileSigner;
use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "init",
    description: "Initialize gittuf root of trust in this repository",
    usage: r#"
Usage

    gittuf init -k <signing-key> [<option>...]

    Creates staged root metadata anchored on the signing key. Use
    `gittuf trust` to grow the root of trust and `gittuf policy apply`
    to promote it.

Options

    -k, --signing-key <path>   Path to a hex-encoded Ed25519 seed
        --help                 Print help
"#,
};

pub fn run(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut key_path: Option<PathBuf> = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Short('k') | Long("signing-key") => {
                key_path = Some(PathBuf::from(parser.value()?));
            }
            arg => return Err(anyhow::anyhow!(arg.unexpected())),
        }
    }

    let repo = terminal::repository()?;
    let signer = FileSigner::from_option(key_path.as_deref())?;
    let root = RootMetadata::new(Principal::Key(Key::ed25519(*signer.public_key())));

    policy::init(&repo, root, &signer)?;
    terminal::info(format_args!(
        "Initialized root of trust with principal {}",
        signer.key_id()
    ));
    Ok(())
}
