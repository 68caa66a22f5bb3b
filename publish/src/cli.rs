use std::{io::Read, path::PathBuf};

use clap::{builder::FalseyValueParser, ArgAction, Parser};
use constcat::concat;
use log::{debug, info};

use crate::{
    config::Payload,
    daemon::DaemonSupervisor,
    docker::{self, Docker},
    pipeline::Pipeline,
    process, Result,
};

pub const LAUNCH_DEBUG_ENV: &str = "DOCKER_LAUNCH_DEBUG";

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// The pipeline payload as JSON, with `workspace`, `build` and `vargs` sections. Read from standard input when
    /// omitted.
    payload: Option<String>,

    /// The container engine client.
    #[arg(long = "docker", default_value = docker::DEFAULT_CLIENT)]
    docker: PathBuf,

    /// The container engine daemon, launched in the background before anything else runs.
    #[arg(long = "dockerd", default_value = docker::DEFAULT_DAEMON)]
    dockerd: PathBuf,

    #[arg(
        long = "launch-debug",
        env = LAUNCH_DEBUG_ENV,
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        help = concat!("Show the output of the container engine daemon instead of discarding it. Can also be enabled by setting ", LAUNCH_DEBUG_ENV, "=true.")
    )]
    launch_debug: bool,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let payload = match self.payload {
            Some(payload) => payload,
            None => {
                let mut payload = String::new();
                std::io::stdin().read_to_string(&mut payload)?;
                payload
            }
        };

        let mut payload =
            Payload::from_json(&payload).map_err(|error| format!("invalid payload: {error}"))?;
        if payload.workspace.path.as_os_str().is_empty() {
            payload.workspace.path = std::env::current_dir()?;
        }
        let config = payload.into_config();
        debug!("effective configuration: {config:?}");

        let runner = process::System;
        let docker = Docker::new(&self.docker, &config.workspace);

        DaemonSupervisor::new(
            &self.dockerd,
            config.storage_driver.as_deref(),
            self.launch_debug,
        )
        .start(&runner, &docker);

        Pipeline::new(&config, &docker, &runner).run()?;

        info!("published {repository}", repository = config.repository);
        Ok(())
    }
}
