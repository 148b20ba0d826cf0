//! Group-MUS extraction delegated to an external MUSer2 process.
//!
//! The seed is written as a GCNF file in which hard clauses (and protected seed members)
//! form the "don't care" group `{0}`, and the seed member at position `k - 1` becomes group `{k}`.
//! The process reports the groups of its MUS on a single `v <k1> <k2> ... 0` line.

use std::collections::BTreeSet;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use process_control::{ChildExt, Control};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cleanup;
use crate::formula::Group;
use crate::params::{MUSER_PATH, MUSER_TIMEOUT};
use crate::table::ClauseTable;

static RESULT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^v [\d ]+$").unwrap());

/// Errors preventing the use of the external minimizer at all.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("MUSer2 binary not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("MUSer2 binary {} is not executable, it may be compiled for a different platform: {source}", .path.display())]
    NotExecutable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors of a single delegated minimization.
#[derive(Error, Debug)]
pub enum MuserError {
    #[error("I/O error while running MUSer2: {0}")]
    Io(#[from] io::Error),
    #[error("MUSer2 did not terminate within {0:?}")]
    Timeout(Duration),
    #[error("no result line in MUSer2 output (exit status: {status}, stderr: {stderr:?})")]
    NoResult { status: String, stderr: String },
    #[error("MUSer2 result refers to an unknown group \"{0}\"")]
    InvalidGroup(String),
    #[error("MUSer2 result lists group {0} more than once")]
    DuplicateGroup(usize),
}

/// A running MUSer2 process, leader of its own process group.
///
/// The whole group is killed and the child reaped when dropped, whatever the path leaving the call.
/// While alive, the process is also registered for termination by [`cleanup`].
struct ChildGuard {
    child: Child,
}

impl ChildGuard {
    fn spawn(command: &mut Command) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command.spawn()?;
        cleanup::register_child(child.id());
        Ok(ChildGuard { child })
    }

    /// Kills the process and any descendant left in its group, then reaps it.
    fn terminate(&mut self) {
        cleanup::kill_process_group(self.child.id());
        // both fail harmlessly if the process already exited and was reaped
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
        cleanup::unregister_child(self.child.id());
    }
}

/// Handle on an external MUSer2 executable.
#[derive(Clone, Debug)]
pub struct Muser {
    path: PathBuf,
    time_limit: Option<Duration>,
}

impl Muser {
    /// Checks that the binary at `path` exists and can be launched on this platform.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SetupError> {
        let path = path.into();
        if !path.is_file() {
            return Err(SetupError::NotFound(path));
        }
        // a trial launch is the only reliable way to detect a binary built for another platform
        let trial = ChildGuard::spawn(
            Command::new(&path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null()),
        );
        match trial {
            Ok(guard) => drop(guard),
            Err(source) => return Err(SetupError::NotExecutable { path, source }),
        }
        Ok(Muser { path, time_limit: None })
    }

    /// Locates the binary through `MARCO_MUSER_PATH`, next to the running executable
    /// if the path is relative, and applies the `MARCO_MUSER_TIMEOUT` time limit.
    pub fn from_env() -> Result<Self, SetupError> {
        let configured = MUSER_PATH.get_ref();
        let path = if configured.is_relative() {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(configured)))
                .unwrap_or_else(|| configured.clone())
        } else {
            configured.clone()
        };
        debug!(param = MUSER_PATH.env(), path = %path.display(), "locating MUSer2");
        let muser = Muser::new(path)?;
        Ok(match MUSER_TIMEOUT.get() {
            0 => muser,
            secs => muser.with_time_limit(Duration::from_secs(secs)),
        })
    }

    /// Kills the process if a single minimization runs longer than `limit`.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    /// Computes a MUS of `seed`, keeping every member of `hard` that appears in the seed.
    ///
    /// The seed is expected to be unsatisfiable. The result lists the groups selected
    /// by MUSer2 in its output order, followed by the protected ones.
    ///
    /// Installs the termination handler of [`cleanup`] on first use.
    #[instrument(skip_all, fields(seed = seed.len(), hard = hard.len()))]
    pub fn shrink(&self, table: &ClauseTable, seed: &[Group], hard: &BTreeSet<Group>) -> Result<Vec<Group>, MuserError> {
        cleanup::install_handler();
        // deleted when dropped, whichever way this function returns
        let mut cnf = tempfile::Builder::new()
            .prefix("marco-")
            .suffix(".gcnf")
            .tempfile()?;
        let _tracked = cleanup::TrackedFile::new(cnf.path());
        {
            let mut out = BufWriter::new(cnf.as_file_mut());
            write_gcnf(&mut out, table, seed, hard)?;
            out.flush()?;
        }

        let start = Instant::now();
        let (status, stdout, stderr) = self.run(cnf.path())?;
        debug!(%status, elapsed = ?start.elapsed(), "MUSer2 finished");

        let result = parse_result(&stdout, seed, hard).map_err(|err| match err {
            MuserError::NoResult { .. } => MuserError::NoResult { status, stderr },
            err => err,
        })?;
        Ok(result)
    }

    /// Runs the process on `cnf` and collects its exit status and outputs.
    fn run(&self, cnf: &Path) -> Result<(String, String, String), MuserError> {
        let mut guard = ChildGuard::spawn(
            Command::new(&self.path)
                .args(["-comp", "-grp", "-v", "-1"])
                .arg(cnf)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped()),
        )?;
        let stdout = guard.child.stdout.take();
        let stderr = guard.child.stderr.take();

        thread::scope(|scope| {
            // both pipes are drained concurrently so that the child never blocks on a full pipe
            let stdout = scope.spawn(move || read_pipe(stdout));
            let stderr = scope.spawn(move || read_pipe(stderr));

            let control = guard.child.controlled();
            let waited = match self.time_limit {
                Some(limit) => control.time_limit(limit).terminate_for_timeout().wait(),
                None => control.wait(),
            };
            // the readers only reach the end of the pipes once no process of the group holds them
            guard.terminate();
            let status = match waited {
                Ok(Some(status)) => status,
                Ok(None) => return Err(MuserError::Timeout(self.time_limit.unwrap_or_default())),
                Err(err) => return Err(err.into()),
            };

            let stdout = join_reader(stdout)?;
            let stderr = join_reader(stderr)?;
            if !status.success() {
                warn!(?status, "MUSer2 exited abnormally");
            }
            Ok((format!("{status:?}"), stdout, stderr))
        })
    }
}

fn read_pipe(pipe: Option<impl Read>) -> io::Result<String> {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_string(&mut buf)?;
    }
    Ok(buf)
}

fn join_reader(handle: thread::ScopedJoinHandle<'_, io::Result<String>>) -> io::Result<String> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")))
}

/// Writes the GCNF instance handed to MUSer2.
///
/// Hard clauses and the clauses of protected seed members go to the "don't care" group `{0}`,
/// the clauses of the seed member at position `k - 1` go to group `{k}`.
pub fn write_gcnf(
    out: &mut impl Write,
    table: &ClauseTable,
    seed: &[Group],
    hard: &BTreeSet<Group>,
) -> io::Result<()> {
    let num_clauses = table.hard_lines().count() + seed.iter().map(|&g| table.group_lines(g).count()).sum::<usize>();
    writeln!(out, "p gcnf {} {} {}", table.num_vars(), num_clauses, seed.len())?;

    for line in table.hard_lines() {
        write!(out, "{{0}} {line}")?;
    }
    for &g in seed.iter().filter(|g| hard.contains(g)) {
        for line in table.group_lines(g) {
            write!(out, "{{0}} {line}")?;
        }
    }
    for (k, &g) in seed.iter().enumerate() {
        if hard.contains(&g) {
            continue;
        }
        for line in table.group_lines(g) {
            write!(out, "{{{}}} {line}", k + 1)?;
        }
    }
    Ok(())
}

/// Extracts the MUS from the output of MUSer2 and maps it back to the groups of `seed`.
///
/// The protected members of the seed are appended to the groups listed by MUSer2.
pub fn parse_result(output: &str, seed: &[Group], hard: &BTreeSet<Group>) -> Result<Vec<Group>, MuserError> {
    let line = RESULT_LINE
        .find(output)
        .ok_or_else(|| MuserError::NoResult {
            status: String::new(),
            stderr: String::new(),
        })?
        .as_str();

    let tokens: Vec<&str> = line.split_whitespace().skip(1).collect();
    let Some((&"0", positions)) = tokens.split_last() else {
        return Err(MuserError::NoResult {
            status: String::new(),
            stderr: String::new(),
        });
    };

    let mut seen = vec![false; seed.len()];
    let mut result = Vec::with_capacity(positions.len() + hard.len());
    for token in positions {
        let k = token
            .parse::<usize>()
            .ok()
            .filter(|&k| 1 <= k && k <= seed.len() && !hard.contains(&seed[k - 1]))
            .ok_or_else(|| MuserError::InvalidGroup(token.to_string()))?;
        if seen[k - 1] {
            return Err(MuserError::DuplicateGroup(k));
        }
        seen[k - 1] = true;
        result.push(seed[k - 1]);
    }
    result.extend(seed.iter().filter(|g| hard.contains(g)));
    Ok(result)
}
