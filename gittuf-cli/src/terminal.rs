//! Small argument and output helpers shared by the commands.

use std::fmt;

pub mod args {
    use std::fmt;

    /// Usage information for one command.
    #[derive(Debug, Clone, Copy)]
    pub struct Help {
        pub name: &'static str,
        pub description: &'static str,
        pub usage: &'static str,
    }

    impl fmt::Display for Help {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.usage)
        }
    }

    impl std::error::Error for Help {}
}

/// Map an error chain onto the documented exit codes: 2 for
/// configuration problems, 3 for verification failures, 4 for
/// object-store and network failures.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<gittuf::verify::Error>() {
            return match e {
                gittuf::verify::Error::Storage(_) => 4,
                _ => 3,
            };
        }
        if let Some(e) = cause.downcast_ref::<gittuf::policy::Error>() {
            return match e {
                gittuf::policy::Error::Verification { .. } => 3,
                gittuf::policy::Error::Storage(_) => 4,
                _ => 2,
            };
        }
        if let Some(e) = cause.downcast_ref::<gittuf::sync::Error>() {
            return match e {
                gittuf::sync::Error::Diverged { .. } => 3,
                gittuf::sync::Error::Storage(_) => 4,
                _ => 2,
            };
        }
        if cause.downcast_ref::<gittuf::tuf::Error>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<gittuf::attestations::Error>().is_some() {
            return 3;
        }
        if let Some(e) = cause.downcast_ref::<gittuf::rsl::Error>() {
            return match e {
                gittuf::rsl::Error::Storage(_) => 4,
                _ => 2,
            };
        }
        if cause.downcast_ref::<gittuf::storage::Error>().is_some()
            || cause.downcast_ref::<git2::Error>().is_some()
            || cause.downcast_ref::<std::io::Error>().is_some()
        {
            return 4;
        }
        if cause.downcast_ref::<lexopt::Error>().is_some() {
            return 2;
        }
    }
    2
}

/// Open the repository in the current directory.
pub fn repository() -> anyhow::Result<gittuf::storage::git::Repository> {
    use anyhow::Context as _;

    gittuf::storage::git::Repository::open(std::env::current_dir()?)
        .context("Current directory is not inside a Git repository")
}

pub fn info(args: impl fmt::Display) {
    println!("{args}");
}
