use std::{ffi::OsStr, path::Path};

use crate::process;

pub const DEFAULT_CLIENT: &str = "/usr/bin/docker";
pub const DEFAULT_DAEMON: &str = "/usr/bin/dockerd";

/// Username for registries that authenticate with a service account key as the password.
pub const LOGIN_USERNAME: &str = "_json_key";

/// Tagging with this tag uses the bare repository reference.
pub const LATEST: &str = "latest";

/// Returns `repository:tag`.
pub fn reference(repository: &str, tag: &str) -> String {
    format!("{repository}:{tag}")
}

/// Like [`reference`], except that [`LATEST`] maps to the bare repository.
pub fn tag_reference(repository: &str, tag: &str) -> String {
    if tag == LATEST {
        repository.to_owned()
    } else {
        reference(repository, tag)
    }
}

/// Returns the command that runs the engine daemon in the foreground of its own process.
pub fn daemon(program: &Path, storage_driver: Option<&str>) -> process::Command {
    match storage_driver {
        Some(driver) => process::command!(program, "--storage-driver", driver),
        None => process::Command::new(program),
    }
}

pub struct BuildArgs<'a> {
    pub dockerfile: &'a str,
    pub context: &'a str,
    pub tag: &'a str,
}

/// Builds engine client commands that all run inside the workspace.
pub struct Docker<'a> {
    client: &'a Path,
    workspace: &'a Path,
}

impl<'a> Docker<'a> {
    pub fn new(client: &'a Path, workspace: &'a Path) -> Self {
        Self { client, workspace }
    }

    fn docker(&self) -> process::Command {
        process::Command::new(self.client).current_dir(self.workspace)
    }

    /// Cheap query that only succeeds once the daemon is up.
    pub fn info(&self) -> process::Command {
        process::args!(self.docker(), "info").silenced().untraced()
    }

    pub fn login(&self, username: &str, password: &str, registry: &str) -> process::Command {
        process::args!(self.docker(), "login", "-u", username, "-p")
            .secret_arg(password)
            .args([OsStr::new(registry)])
    }

    pub fn load(&self, archive: &Path) -> process::Command {
        process::args!(self.docker(), "load", "-i", archive)
    }

    pub fn build(&self, args: BuildArgs) -> process::Command {
        process::args!(
            self.docker(),
            "build",
            "--pull=true",
            "--rm=true",
            "-f",
            args.dockerfile,
            "-t",
            args.tag,
            args.context,
        )
    }

    pub fn tag(&self, source: &str, target: &str) -> process::Command {
        process::args!(self.docker(), "tag", source, target)
    }

    pub fn push(&self, reference: &str) -> process::Command {
        process::args!(self.docker(), "push", reference)
    }

    pub fn save<'r, I>(&self, archive: &Path, references: I) -> process::Command
    where
        I: IntoIterator<Item = &'r str>,
    {
        process::args!(self.docker(), "save", "-o", archive)
            .args(references.into_iter().map(OsStr::new))
    }
}
