use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{anyhow, Context as _};

use crate::terminal;
use crate::terminal::args::Help;

pub const HELP: Help = Help {
    name: "clone",
    description: "Clone a repository together with its gittuf state",
    usage: r#"
Usage

    gittuf clone <url> [<directory>]

    Clones the repository and fetches the gittuf refs (log, policy and
    attestations). Run `gittuf verify-ref` afterwards to check the
    default branch against the log.

Options

    --help    Print help
"#,
};

pub fn run(args: Vec<OsString>) -> anyhow::Result<()> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_args(args);
    let mut url: Option<String> = None;
    let mut directory: Option<PathBuf> = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("help") | Short('h') => return Err(HELP.into()),
            Value(value) if url.is_none() => url = Some(value.string()?),
            Value(value) if directory.is_none() => {
                directory = Some(PathBuf::from(value));
            }
            arg => return Err(anyhow!(arg.unexpected())),
        }
    }
    let url = url.ok_or_else(|| anyhow!("a repository URL is required"))?;
    let directory = directory.unwrap_or_else(|| {
        let name = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("repository")
            .trim_end_matches(".git");
        PathBuf::from(name)
    });

    git2::Repository::clone(&url, &directory)
        .with_context(|| format!("Cloning {url} failed"))?;

    use gittuf::storage::WriteRepository as _;
    let repo = gittuf::storage::git::Repository::open(&directory)?;
    repo.fetch(
        "origin",
        &["+refs/gittuf/reference-state-log:refs/gittuf/reference-state-log".to_owned(),
          "+refs/gittuf/policy:refs/gittuf/policy".to_owned(),
          "+refs/gittuf/attestations:refs/gittuf/attestations".to_owned()],
    )
    .context("Fetching gittuf refs failed; is the remote gittuf-enabled?")?;

    terminal::info(format_args!(
        "Cloned {url} into {}",
        directory.display()
    ));
    Ok(())
}
