//! The publish sequence: login, optional cache restore, build, tag, push and optional archive.
//!
//! Stages run strictly in order and the first failure ends the run. Nothing that already happened is undone, so a
//! failed push may leave some tags applied locally and a failed archive leaves the image published.

use std::{fmt, io, path::PathBuf};

use log::info;

use crate::{
    config::EffectiveConfig,
    docker::{self, Docker},
    process::{self, Runner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Login,
    Load,
    Build,
    Tag,
    Push,
    Save,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Login => "login",
            Stage::Load => "load",
            Stage::Build => "build",
            Stage::Tag => "tag",
            Stage::Push => "push",
            Stage::Save => "save",
        })
    }
}

#[derive(Debug)]
pub enum Error {
    LoginFailed(process::Error),
    Command {
        stage: Stage,
        source: process::Error,
    },
    CreateArchiveDir {
        path: PathBuf,
        source: io::Error,
    },
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::LoginFailed(_) => Stage::Login,
            Error::Command { stage, .. } => *stage,
            Error::CreateArchiveDir { .. } => Stage::Save,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LoginFailed(source) => write!(f, "login failed: {source}"),
            Error::Command { stage, source } => write!(f, "{stage} failed: {source}"),
            Error::CreateArchiveDir { path, source } => {
                write!(f, "failed to create archive directory {path:?}: {source}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::LoginFailed(source) | Error::Command { source, .. } => Some(source),
            Error::CreateArchiveDir { source, .. } => Some(source),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Pipeline<'a> {
    config: &'a EffectiveConfig,
    docker: &'a Docker<'a>,
    runner: &'a dyn Runner,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a EffectiveConfig,
        docker: &'a Docker<'a>,
        runner: &'a dyn Runner,
    ) -> Self {
        Self {
            config,
            docker,
            runner,
        }
    }

    pub fn run(&self) -> Result<()> {
        self.login()?;
        self.load()?;
        self.build()?;
        self.tag()?;
        self.push()?;
        self.save()?;
        Ok(())
    }

    fn exec(&self, stage: Stage, command: process::Command) -> Result<()> {
        self.runner
            .run(command)
            .map_err(|source| Error::Command { stage, source })
    }

    pub fn login(&self) -> Result<()> {
        let EffectiveConfig {
            registry, token, ..
        } = self.config;
        info!("logging in to {registry}");
        let command = self
            .docker
            .login(docker::LOGIN_USERNAME, token.expose(), registry);
        self.runner.run(command).map_err(Error::LoginFailed)
    }

    /// Restores previously saved images so the build can reuse their layers. A missing archive only means there is
    /// nothing to restore yet.
    pub fn load(&self) -> Result<()> {
        let Some(archive) = &self.config.load else {
            return Ok(());
        };

        if !archive.exists() {
            info!(
                "Archive {archive} does not exist. Building from scratch.",
                archive = archive.display()
            );
            return Ok(());
        }

        self.exec(Stage::Load, self.docker.load(archive))
    }

    pub fn build(&self) -> Result<()> {
        let EffectiveConfig {
            commit,
            dockerfile,
            context,
            ..
        } = self.config;
        self.exec(
            Stage::Build,
            self.docker.build(docker::BuildArgs {
                dockerfile,
                context,
                tag: commit,
            }),
        )
    }

    pub fn tag(&self) -> Result<()> {
        let EffectiveConfig {
            commit,
            repository,
            tags,
            ..
        } = self.config;
        for tag in tags {
            let target = docker::tag_reference(repository, tag);
            self.exec(Stage::Tag, self.docker.tag(commit, &target))?;
        }
        Ok(())
    }

    /// Pushes every tag applied to the repository.
    pub fn push(&self) -> Result<()> {
        let repository = &self.config.repository;
        info!("pushing {repository}");
        self.exec(Stage::Push, self.docker.push(repository))
    }

    pub fn save(&self) -> Result<()> {
        let Some(save) = &self.config.save else {
            return Ok(());
        };

        if let Some(dir) = save.destination.parent() {
            std::fs::create_dir_all(dir).map_err(|source| Error::CreateArchiveDir {
                path: dir.to_owned(),
                source,
            })?;
        }

        let repository = &self.config.repository;
        let references = if save.tags.is_empty() {
            vec![repository.clone()]
        } else {
            save.tags
                .iter()
                .map(|tag| docker::reference(repository, tag))
                .collect()
        };

        self.exec(
            Stage::Save,
            self.docker
                .save(&save.destination, references.iter().map(String::as_str)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        config::{self, Params, Save, Secret},
        process::{fake::Recorder, SECRET_MASK},
    };

    const COMMIT: &str = "9f2a6c1";

    fn normalized(workspace: &Path, params: Params) -> EffectiveConfig {
        config::normalize(params, workspace.to_owned(), COMMIT.to_owned())
    }

    fn run(config: &EffectiveConfig, runner: &Recorder) -> Result<()> {
        let docker = Docker::new(Path::new("docker"), &config.workspace);
        Pipeline::new(config, &docker, runner).run()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|&value| value.to_owned()).collect()
    }

    #[test]
    fn test_default_tag_scenario() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                repo: "ns/app".to_owned(),
                token: Secret::new(" abc \n"),
                ..Default::default()
            },
        );
        let runner = Recorder::new();
        run(&config, &runner).unwrap();

        assert_eq!(
            runner.calls(),
            [
                strings(&["docker", "login", "-u", "_json_key", "-p", SECRET_MASK, "gcr.io"]),
                strings(&[
                    "docker",
                    "build",
                    "--pull=true",
                    "--rm=true",
                    "-f",
                    "Dockerfile",
                    "-t",
                    COMMIT,
                    "."
                ]),
                strings(&["docker", "tag", COMMIT, "gcr.io/ns/app"]),
                strings(&["docker", "push", "gcr.io/ns/app"]),
            ]
        );
    }

    #[test]
    fn test_multi_tag_and_save_scenario() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                repo: "gcr.io/ns/app".to_owned(),
                tag: strings(&["v1", "latest"]),
                save: Save {
                    destination: "out/img.tar".to_owned(),
                    tag: strings(&["v1"]),
                },
                ..Default::default()
            },
        );
        let runner = Recorder::new();
        run(&config, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(
            runner.subcommands(),
            ["login", "build", "tag", "tag", "push", "save"]
        );
        assert_eq!(calls[2], strings(&["docker", "tag", COMMIT, "gcr.io/ns/app:v1"]));
        assert_eq!(calls[3], strings(&["docker", "tag", COMMIT, "gcr.io/ns/app"]));

        let archive = workspace.path().join("out/img.tar");
        assert_eq!(
            calls[5],
            strings(&[
                "docker",
                "save",
                "-o",
                archive.to_str().unwrap(),
                "gcr.io/ns/app:v1"
            ])
        );
        assert!(workspace.path().join("out").is_dir());
    }

    #[test]
    fn test_save_without_tags_archives_bare_repository() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                repo: "gcr.io/ns/app".to_owned(),
                save: Save {
                    destination: "nested/dir/img.tar".to_owned(),
                    tag: Vec::new(),
                },
                ..Default::default()
            },
        );
        let runner = Recorder::new();
        run(&config, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls.last().and_then(|argv| argv.last()).map(String::as_str),
            Some("gcr.io/ns/app")
        );
        assert!(workspace.path().join("nested/dir").is_dir());
    }

    #[test]
    fn test_missing_load_archive_is_skipped() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                repo: "gcr.io/ns/app".to_owned(),
                load: "cache/img.tar".to_owned(),
                ..Default::default()
            },
        );
        let runner = Recorder::new();
        run(&config, &runner).unwrap();

        assert_eq!(runner.subcommands(), ["login", "build", "tag", "push"]);
    }

    #[test]
    fn test_existing_load_archive_is_loaded_before_build() {
        let workspace = tempfile::tempdir().unwrap();
        let archive = workspace.path().join("img.tar");
        std::fs::write(&archive, b"").unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                repo: "gcr.io/ns/app".to_owned(),
                load: "img.tar".to_owned(),
                ..Default::default()
            },
        );
        let runner = Recorder::new();
        run(&config, &runner).unwrap();

        assert_eq!(
            runner.subcommands(),
            ["login", "load", "build", "tag", "push"]
        );
        assert_eq!(
            runner.calls()[1],
            strings(&["docker", "load", "-i", archive.to_str().unwrap()])
        );
    }

    #[test]
    fn test_load_failure_is_fatal() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("img.tar"), b"").unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                load: "img.tar".to_owned(),
                ..Default::default()
            },
        );
        let runner = Recorder::failing_when(|argv| argv[1] == "load");
        let error = run(&config, &runner).unwrap_err();

        assert_eq!(error.stage(), Stage::Load);
        assert_eq!(runner.subcommands(), ["login", "load"]);
    }

    #[test]
    fn test_login_failure_is_reported_as_such() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(workspace.path(), Params::default());
        let runner = Recorder::failing_when(|argv| argv[1] == "login");
        let error = run(&config, &runner).unwrap_err();

        assert!(matches!(error, Error::LoginFailed(_)));
        assert!(error.to_string().starts_with("login failed"));
        assert_eq!(runner.subcommands(), ["login"]);
    }

    #[test]
    fn test_build_failure_stops_everything_after_it() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                tag: strings(&["v1", "v2"]),
                save: Save {
                    destination: "out/img.tar".to_owned(),
                    tag: Vec::new(),
                },
                ..Default::default()
            },
        );
        let runner = Recorder::failing_when(|argv| argv[1] == "build");
        let error = run(&config, &runner).unwrap_err();

        assert_eq!(error.stage(), Stage::Build);
        assert_eq!(runner.subcommands(), ["login", "build"]);
        assert!(!workspace.path().join("out").exists());
    }

    #[test]
    fn test_tag_failure_skips_remaining_tags() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                repo: "gcr.io/ns/app".to_owned(),
                tag: strings(&["v1", "v2", "v3"]),
                ..Default::default()
            },
        );
        let runner =
            Recorder::failing_when(|argv| argv.last().is_some_and(|arg| arg.ends_with(":v2")));
        let error = run(&config, &runner).unwrap_err();

        assert_eq!(error.stage(), Stage::Tag);
        assert_eq!(runner.subcommands(), ["login", "build", "tag", "tag"]);
    }

    #[test]
    fn test_push_failure_skips_save() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                repo: "gcr.io/ns/app".to_owned(),
                save: Save {
                    destination: "img.tar".to_owned(),
                    tag: Vec::new(),
                },
                ..Default::default()
            },
        );
        let runner = Recorder::failing_when(|argv| argv[1] == "push");
        let error = run(&config, &runner).unwrap_err();

        assert_eq!(error.stage(), Stage::Push);
        assert_eq!(runner.subcommands(), ["login", "build", "tag", "push"]);
    }

    #[test]
    fn test_save_failure_is_fatal() {
        let workspace = tempfile::tempdir().unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                save: Save {
                    destination: "img.tar".to_owned(),
                    tag: Vec::new(),
                },
                ..Default::default()
            },
        );
        let runner = Recorder::failing_when(|argv| argv[1] == "save");
        let error = run(&config, &runner).unwrap_err();

        assert_eq!(error.stage(), Stage::Save);
        assert!(error.to_string().starts_with("save failed"));
    }

    #[test]
    fn test_unwritable_archive_directory_is_fatal() {
        let workspace = tempfile::tempdir().unwrap();
        // A file where the archive directory should be.
        std::fs::write(workspace.path().join("out"), b"").unwrap();
        let config = normalized(
            workspace.path(),
            Params {
                save: Save {
                    destination: "out/img.tar".to_owned(),
                    tag: Vec::new(),
                },
                ..Default::default()
            },
        );
        let runner = Recorder::new();
        let error = run(&config, &runner).unwrap_err();

        assert!(matches!(error, Error::CreateArchiveDir { .. }));
        assert_eq!(runner.subcommands(), ["login", "build", "tag", "push"]);
    }
}
