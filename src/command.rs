use core::fmt;
use std::{
    borrow::Cow,
    fmt::{Debug, Display},
    process::{ExitStatus, Stdio},
    str::Utf8Error,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use owo_colors::{AnsiColors, OwoColorize};
use stacked_errors::{bail_locationless, DisplayStr, Result, StackableErr};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process,
    sync::Mutex,
    task::{self, JoinHandle},
};

use crate::FileOptions;

const TERMINAL_COLORS: [AnsiColors; 6] = [
    AnsiColors::Cyan,
    AnsiColors::Magenta,
    AnsiColors::Green,
    AnsiColors::Yellow,
    AnsiColors::Blue,
    AnsiColors::BrightCyan,
];

static COLOR_ROTATION: AtomicUsize = AtomicUsize::new(0);

fn next_terminal_color() -> AnsiColors {
    TERMINAL_COLORS[COLOR_ROTATION.fetch_add(1, Ordering::Relaxed) % TERMINAL_COLORS.len()]
}

/// An OS command, `tokio::process::Command` wrapped in helping functionality.
///
/// Every command here is run once to completion with its standard streams
/// recorded, optionally forwarded live to the current process's streams with a
/// colored per-command line prefix, and optionally copied to log files.
#[derive(Clone)]
pub struct Command {
    /// The program to run
    pub program: String,
    /// All the arguments that will be passed to the program
    pub args: Vec<String>,
    /// If set, the command will copy the `stdout` to the file
    pub stdout_log: Option<FileOptions>,
    /// If set, the command will copy the `stderr` to the file
    pub stderr_log: Option<FileOptions>,
    /// Forward stdout to the current process stdout
    pub stdout_debug: bool,
    /// Forward stderr to the current process stderr
    pub stderr_debug: bool,
}

impl Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Command {{program: {:?},",
            DisplayStr(&self.get_unified_command()),
        ))?;
        if let Some(log) = self.stdout_log.as_ref().map(|x| &x.path) {
            f.write_fmt(format_args!(" stdout_log: {log:?},"))?;
        }
        if let Some(log) = self.stderr_log.as_ref().map(|x| &x.path) {
            f.write_fmt(format_args!(" stderr_log: {log:?},"))?;
        }
        if self.stdout_debug || self.stderr_debug {
            f.write_fmt(format_args!(
                " debug: ({}, {}),",
                self.stdout_debug, self.stderr_debug
            ))?;
        }
        f.write_fmt(format_args!("}}"))
    }
}

impl Command {
    /// Creates a `Command` that only sets the `program` and `args` and leaves
    /// other things as their default values. `program_with_args` is separated
    /// by whitespace, the first part becomes the program, and the others are
    /// inserted as args.
    ///
    /// In case an argument has spaces, it should be added through
    /// [Command::arg] as an unbroken `&str`.
    pub fn new(program_with_args: impl AsRef<str>) -> Self {
        let mut program = String::new();
        let mut args: Vec<String> = vec![];
        for (i, part) in program_with_args.as_ref().split_whitespace().enumerate() {
            if i == 0 {
                part.clone_into(&mut program)
            } else {
                args.push(part.to_owned());
            }
        }
        Self {
            program,
            args,
            stdout_log: None,
            stderr_log: None,
            stdout_debug: false,
            stderr_debug: false,
        }
    }

    /// Adds an argument
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Adds arguments to be passed to the program
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().to_owned()));
        self
    }

    /// Sets `stdout_debug` and `stderr_debug` for passing command standard
    /// streams to the standard streams of this process
    pub fn debug(mut self, std_stream_debug: bool) -> Self {
        self.stdout_debug = std_stream_debug;
        self.stderr_debug = std_stream_debug;
        self
    }

    /// Sets `stdout_log` and `stderr_log` for copying command standard streams
    /// to the same file
    pub fn log(mut self, std_stream_log: Option<&FileOptions>) -> Self {
        if let Some(f) = std_stream_log {
            self.stdout_log = Some(f.clone());
            self.stderr_log = Some(f.clone());
        }
        self
    }

    /// Gets the program and args interspersed with spaces
    pub(crate) fn get_unified_command(&self) -> String {
        let mut command = self.program.clone();
        for arg in &self.args {
            command += " ";
            command += arg;
        }
        command
    }

    /// Runs the command to completion, returning the `CommandResult`.
    ///
    /// Note: success of this function only means that the OS calls and stream
    /// copying succeeded, it does not mean the command itself had a successful
    /// return status, use `assert_success` or check the `status` on the
    /// `CommandResult`.
    pub async fn run_to_completion(self) -> Result<CommandResult> {
        let mut cmd = process::Command::new(&self.program);
        // do as much as possible before spawning the process
        let stdout_log = match self.stdout_log {
            Some(ref options) => Some(options.acquire_file().await?),
            None => None,
        };
        let stderr_log = match self.stderr_log {
            Some(ref options) => Some(options.acquire_file().await?),
            None => None,
        };
        cmd.args(&self.args).kill_on_drop(true);
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .stack_err_with_locationless(|| {
                format!("{self:?}.run_to_completion() -> failed to spawn child process")
            })?;
        let child_id = child.id().unwrap_or(0);
        let terminal_color = if self.stdout_debug || self.stderr_debug {
            next_terminal_color()
        } else {
            AnsiColors::Default
        };
        let stdout_record = Arc::new(Mutex::new(Vec::new()));
        let stderr_record = Arc::new(Mutex::new(Vec::new()));
        let mut handles: Vec<JoinHandle<()>> = vec![];
        let stdout_forward = self.stdout_debug.then(|| {
            (
                tokio::io::stdout(),
                format!("{} {}  | ", self.program, child_id)
                    .color(terminal_color)
                    .to_string(),
            )
        });
        let stderr_forward = self.stderr_debug.then(|| {
            (
                tokio::io::stderr(),
                format!("{} {} E| ", self.program, child_id)
                    .color(terminal_color)
                    .to_string(),
            )
        });
        handles.push(task::spawn(copier(
            BufReader::new(child.stdout.take().unwrap()),
            Arc::clone(&stdout_record),
            stdout_log,
            stdout_forward,
        )));
        handles.push(task::spawn(copier(
            BufReader::new(child.stderr.take().unwrap()),
            Arc::clone(&stderr_record),
            stderr_log,
            stderr_forward,
        )));
        let status = child.wait().await.stack_err_with_locationless(|| {
            format!("{self:?}.run_to_completion() -> failed when waiting on child process")
        })?;
        // the copiers must finish first so that no lock is held and no data is lost
        while let Some(handle) = handles.pop() {
            handle.await.stack_err_with_locationless(|| {
                format!("{self:?}.run_to_completion() -> stream copier task panicked")
            })?;
        }
        let stdout = stdout_record.lock().await.clone();
        let stderr = stderr_record.lock().await.clone();
        Ok(CommandResult {
            command: self,
            status: Some(status),
            stdout,
            stderr,
        })
    }
}

/// Used as the engine of the stdout and stderr copying tasks. `expect`s are
/// used in here because it is spawned as a separate task.
async fn copier<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    std_read: BufReader<R>,
    record: Arc<Mutex<Vec<u8>>>,
    mut std_log: Option<File>,
    mut std_forward: Option<(W, String)>,
) {
    let mut segments = std_read.split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(mut line)) => {
                line.push(b'\n');
                // copying for the `CommandResult`
                record.lock().await.extend_from_slice(&line);
                // copying to file
                if let Some(ref mut std_log) = std_log {
                    std_log
                        .write_all(&line)
                        .await
                        .expect("command stream to file copier failed");
                }
                // forwarding to the current process's stream, the prefix needs
                // to be written together with the line or else interleaving
                // between commands is too common
                if let Some((ref mut std_forward, ref prefix)) = std_forward {
                    let mut buf = Vec::with_capacity(prefix.len() + line.len());
                    buf.extend_from_slice(prefix.as_bytes());
                    buf.extend_from_slice(&line);
                    std_forward
                        .write_all(&buf)
                        .await
                        .expect("command stream forwarding failed");
                    std_forward
                        .flush()
                        .await
                        .expect("command stream forwarding failed");
                }
            }
            Ok(None) => break,
            Err(e) => panic!("command stream copier failed with {}", e),
        }
    }
    if let Some(mut std_log) = std_log {
        std_log
            .flush()
            .await
            .expect("command stream to file copier failed");
    }
}

/// The result of a [Command](crate::Command)
#[must_use]
#[derive(Clone)]
pub struct CommandResult {
    // the command information is kept around for failures
    pub command: Command,
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "CommandResult {{\ncommand: {:?},\nstatus: {:?},\n",
            self.command, self.status
        ))?;
        let stdout = self.stdout_as_utf8_lossy();
        if !stdout.is_empty() {
            f.write_fmt(format_args!("stdout: {}\n,", stdout))?;
        }
        let stderr = self.stderr_as_utf8_lossy();
        if !stderr.is_empty() {
            f.write_fmt(format_args!("stderr: {}\n,", stderr))?;
        }
        f.write_fmt(format_args!("}}"))
    }
}

impl Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#?}", self))
    }
}

impl CommandResult {
    /// Returns if the command completed with a successful return status
    pub fn successful(&self) -> bool {
        if let Some(status) = self.status.as_ref() {
            status.success()
        } else {
            false
        }
    }

    /// Returns a formatted error with relevant information if the command was
    /// not successful
    pub fn assert_success(&self) -> Result<()> {
        if let Some(status) = self.status.as_ref() {
            if status.success() {
                Ok(())
            } else {
                bail_locationless!("{self:#?}.assert_success() -> unsuccessful")
            }
        } else {
            bail_locationless!(
                "{self:#?}.assert_success() -> termination was called before completion"
            )
        }
    }

    /// Returns `str::from_utf8(&self.stdout)`
    pub fn stdout_as_utf8(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(&self.stdout)
    }

    /// Returns `str::from_utf8(&self.stderr)`
    pub fn stderr_as_utf8(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(&self.stderr)
    }

    /// Returns `String::from_utf8_lossy(&self.stdout)`
    pub fn stdout_as_utf8_lossy(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Returns `String::from_utf8_lossy(&self.stderr)`
    pub fn stderr_as_utf8_lossy(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_reports_success() {
        let comres = Command::new("echo hello")
            .run_to_completion()
            .await
            .unwrap();
        assert!(comres.successful());
        comres.assert_success().unwrap();
        assert_eq!(comres.stdout_as_utf8().unwrap(), "hello\n");
        assert!(comres.stderr.is_empty());
    }

    #[tokio::test]
    async fn captures_stderr_and_an_unsuccessful_status() {
        let comres = Command::new("sh -c")
            .arg("printf fault >&2; exit 3")
            .run_to_completion()
            .await
            .unwrap();
        assert!(!comres.successful());
        assert!(comres.assert_success().is_err());
        // the copier normalizes a missing final newline
        assert_eq!(comres.stderr_as_utf8().unwrap(), "fault\n");
        assert!(comres.stdout.is_empty());
    }

    #[tokio::test]
    async fn copies_streams_to_an_appended_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("cmd.log");
        let log = FileOptions::write(&log_path).append(true).unwrap();
        for line in ["first", "second"] {
            Command::new("echo")
                .arg(line)
                .log(Some(&log))
                .run_to_completion()
                .await
                .unwrap()
                .assert_success()
                .unwrap();
        }
        let logged = FileOptions::read_to_string(&log_path).await.unwrap();
        assert_eq!(logged, "first\nsecond\n");
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_a_status() {
        assert!(Command::new("hydrobox-test-no-such-program")
            .run_to_completion()
            .await
            .is_err());
    }
}
