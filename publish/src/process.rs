use std::{
    borrow::Cow,
    ffi::OsStr,
    fmt, io,
    num::NonZeroI32,
    path::Path,
    process::{self, Stdio},
};

use log::debug;

/// Replaces secret arguments in traces and error messages.
pub const SECRET_MASK: &str = "********";

/// Prefix of the command trace written to standard error.
pub const TRACE_MARKER: &str = "$";

pub struct Command {
    inner: process::Command,
    /// Indices into the argument list (not counting the program) that must never be displayed.
    secrets: Vec<usize>,
    traced: bool,
    silenced: bool,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{self}`")
    }
}

/// Shell-quoted argument vector with secrets masked.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, arg) in self.argv().iter().enumerate() {
            if index != 0 {
                f.write_str(" ")?;
            }
            f.write_str(&quote(arg))?;
        }
        Ok(())
    }
}

/// Like [`shell_words::quote`], but leaves `=` between otherwise plain words alone so `--pull=true` reads as typed.
fn quote(arg: &str) -> Cow<'_, str> {
    if arg
        .split('=')
        .all(|part| !part.is_empty() && shell_words::quote(part) == part)
    {
        Cow::Borrowed(arg)
    } else {
        shell_words::quote(arg)
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            inner: process::Command::new(program),
            secrets: Vec::new(),
            traced: true,
            silenced: false,
        }
    }

    pub fn args<'a, I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = &'a OsStr>,
    {
        self.inner.args(args);
        self
    }

    /// Appends an argument that is masked in traces, logs and error messages.
    pub fn secret_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.secrets.push(self.inner.get_args().len());
        self.inner.arg(arg);
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.inner.current_dir(dir);
        self
    }

    /// Discards the standard output and standard error of the command.
    pub fn silenced(mut self) -> Self {
        self.inner.stdout(Stdio::null()).stderr(Stdio::null());
        self.silenced = true;
        self
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced
    }

    /// Skips the trace line that is otherwise printed before the command runs.
    pub fn untraced(mut self) -> Self {
        self.traced = false;
        self
    }

    /// The program followed by its arguments, lossily converted to UTF-8, with secrets masked.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.inner.get_program().to_string_lossy().into_owned())
            .chain(self.inner.get_args().enumerate().map(|(index, arg)| {
                if self.secrets.contains(&index) {
                    SECRET_MASK.to_owned()
                } else {
                    arg.to_string_lossy().into_owned()
                }
            }))
            .collect()
    }

    /// The line echoed to standard error before the command runs, if any.
    pub fn trace_line(&self) -> Option<String> {
        self.traced.then(|| format!("{TRACE_MARKER} {self}"))
    }

    pub fn try_status(mut self) -> Result<ExitStatus, Error> {
        if let Some(line) = self.trace_line() {
            eprintln!("{line}");
        }
        debug!("running {self:?}...");

        match self.inner.status() {
            Ok(status) => Ok(ExitStatus {
                command: self,
                status,
            }),
            Err(error) => Err(Error {
                command: self,
                kind: error.into(),
            }),
        }
    }

    pub fn status(self) -> Result<(), Error> {
        self.try_status().and_then(ExitStatus::require_success)
    }
}

/// Executes commands on behalf of the pipeline.
pub trait Runner {
    /// Runs the command to completion and fails unless it exits successfully.
    fn run(&self, command: Command) -> Result<()>;
}

/// Spawns real processes on the host.
pub struct System;

impl Runner for System {
    fn run(&self, command: Command) -> Result<()> {
        command.status()
    }
}

#[derive(Debug)]
pub struct ExitStatus {
    command: Command,
    status: process::ExitStatus,
}

impl ExitStatus {
    pub fn require_success(self) -> Result<(), Error> {
        let ExitStatus { command, status } = self;
        if status.success() {
            Ok(())
        } else {
            Err(Error {
                command,
                kind: ErrorKind::NonZeroExitStatus(status.code().and_then(NonZeroI32::new)),
            })
        }
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Io(io::Error),
    NonZeroExitStatus(Option<NonZeroI32>),
}

impl From<io::Error> for ErrorKind {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Io(value),
        }
    }
}

#[derive(Debug)]
pub struct Error {
    pub command: Command,
    pub kind: ErrorKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to run `{command}`: ", command = &self.command)?;
        match &self.kind {
            ErrorKind::NotFound => {
                let program = self.command.inner.get_program().to_string_lossy();
                write!(f, "the `{program}` command is required but not available on this system")
            }
            ErrorKind::PermissionDenied => {
                let program = self.command.inner.get_program().to_string_lossy();
                write!(f, "the `{program}` command is available but does not have the right permissions, please make sure the binary is executable")
            }
            ErrorKind::Io(error) => write!(f, "{error}"),
            ErrorKind::NonZeroExitStatus(code) => {
                if let Some(code) = code {
                    write!(f, "exited with non-zero exit code `{code}`")
                } else {
                    write!(f, "did not run succesfully")
                }
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates a new [`Command`] and supplies the provided arguments, if any, while calling
/// [`std::convert::AsRef::as_ref`] on each.
macro_rules! command {
    ($program:expr, $($arg:expr),* $(,)?) => {
        $crate::process::args!($crate::process::Command::new($program), $($arg,)*)
    };
}

/// Calls [`Command::args`] on the provided [`Command`] while calling [`std::convert::AsRef::as_ref`]
/// on each argument.
macro_rules! args {
    ($program:expr, $($arg:expr),+ $(,)?) => {
        $program.args([
            $(::std::convert::AsRef::<::std::ffi::OsStr>::as_ref(&$arg),)*
        ])
    }
}

pub(crate) use args;
pub(crate) use command;
