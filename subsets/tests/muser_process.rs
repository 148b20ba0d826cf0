//! Exercises the external minimizer protocol against a fake MUSer2 shell script.
#![cfg(unix)]

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use marco_subsets::cleanup::INTERRUPTED_EXIT_CODE;
use marco_subsets::{Formula, MinimizationStrategy, Muser, MuserError, SetupError, SubsetError, SubsetSolver};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tempfile::TempDir;

/// Set when this test binary is started again to run `interrupted_shrink` on its own.
const INTERRUPTED_DIR: &str = "MARCO_TEST_INTERRUPTED_DIR";

/// Spawning a script while another thread still holds it open for writing fails with ETXTBSY,
/// so the tests of this file never run concurrently.
static SEQUENTIAL: Mutex<()> = Mutex::new(());

/// A directory holding a fake MUSer2 that prints the content of `answer`,
/// after copying its input file to `last.gcnf` and its input path to `last_path`.
struct FakeMuser {
    dir: TempDir,
}

impl FakeMuser {
    fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = format!(
            "#!/bin/sh\n[ $# -eq 0 ] && exit 0\nDIR='{}'\n{}\n",
            dir.path().display(),
            body
        );
        let path = dir.path().join("muser2");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        FakeMuser { dir }
    }

    fn echoing() -> Self {
        Self::new("cp \"$5\" \"$DIR/last.gcnf\"\necho \"$5\" > \"$DIR/last_path\"\necho 'c fake MUSer2'\ncat \"$DIR/answer\"")
    }

    fn path(&self) -> PathBuf {
        self.dir.path().join("muser2")
    }

    fn answer(&self, output: &str) {
        fs::write(self.dir.path().join("answer"), output).unwrap();
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.dir.path().join(name)).unwrap()
    }
}

/// Groups 0 and 1 are jointly unsatisfiable, group 2 is always satisfiable.
fn pair_conflict() -> Formula {
    Formula::parse("p gcnf 2 4 3\n{0} 1 2 0\n{1} 1 0\n{2} -1 0\n{3} 2 0\n".as_bytes()).unwrap()
}

#[test]
fn test_setup_errors() {
    let _lock = SEQUENTIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing");
    assert!(matches!(Muser::new(&missing), Err(SetupError::NotFound(p)) if p == missing));

    let not_executable = dir.path().join("muser2");
    fs::write(&not_executable, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&not_executable, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(matches!(
        Muser::new(&not_executable),
        Err(SetupError::NotExecutable { .. })
    ));
}

#[test]
fn test_delegated_shrink() {
    let _lock = SEQUENTIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fake = FakeMuser::echoing();
    fake.answer("v 1 2 0\n");
    let muser = Muser::new(fake.path()).unwrap();
    let mut solver = SubsetSolver::with_strategy(&pair_conflict(), MinimizationStrategy::ExternalDelegate(muser));

    let mus = solver.shrink([0, 1, 2], &BTreeSet::new()).unwrap();
    assert_eq!(mus, BTreeSet::from([0, 1]));

    let expected = "p gcnf 2 4 3\n\
                    {0} 1 2 0\n\
                    {1} 1 0\n\
                    {2} -1 0\n\
                    {3} 2 0\n";
    assert_eq!(fake.read("last.gcnf"), expected);

    // the temporary file does not outlive the call
    let tmp = fake.read("last_path");
    assert!(!Path::new(tmp.trim()).exists());
}

#[test]
fn test_delegated_shrink_with_protected_groups() {
    let _lock = SEQUENTIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fake = FakeMuser::echoing();
    // position 2 of the seed, i.e. group 0
    fake.answer("v 2 0\n");
    let muser = Muser::new(fake.path()).unwrap();
    let mut solver = SubsetSolver::with_strategy(&pair_conflict(), MinimizationStrategy::ExternalDelegate(muser));

    let mus = solver.shrink([2, 0, 1], &BTreeSet::from([1])).unwrap();
    assert_eq!(mus, BTreeSet::from([0, 1]));

    let expected = "p gcnf 2 4 3\n\
                    {0} 1 2 0\n\
                    {0} -1 0\n\
                    {1} 2 0\n\
                    {2} 1 0\n";
    assert_eq!(fake.read("last.gcnf"), expected);
}

#[test]
fn test_missing_result_line() {
    let _lock = SEQUENTIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fake = FakeMuser::new("echo 'c giving up' >&2\necho 's UNKNOWN'\nexit 1");
    let muser = Muser::new(fake.path()).unwrap();
    let mut solver = SubsetSolver::with_strategy(&pair_conflict(), MinimizationStrategy::ExternalDelegate(muser));

    match solver.shrink([0, 1, 2], &BTreeSet::new()) {
        Err(SubsetError::Minimizer(MuserError::NoResult { stderr, .. })) => assert!(stderr.contains("giving up")),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_time_limit_kills_process() {
    let _lock = SEQUENTIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fake = FakeMuser::new("echo $$ > \"$DIR/pid\"\nexec sleep 30");
    let muser = Muser::new(fake.path())
        .unwrap()
        .with_time_limit(Duration::from_millis(300));
    let mut solver = SubsetSolver::with_strategy(&pair_conflict(), MinimizationStrategy::ExternalDelegate(muser));

    let start = Instant::now();
    let res = solver.shrink([0, 1, 2], &BTreeSet::new());
    assert!(matches!(res, Err(SubsetError::Minimizer(MuserError::Timeout(_)))));
    assert!(start.elapsed() < Duration::from_secs(20));

    // the process is gone, not merely detached
    if cfg!(target_os = "linux") {
        let pid = fake.read("pid");
        assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
    }
}

#[test]
fn test_time_limit_kills_forked_descendants() {
    let _lock = SEQUENTIAL.lock().unwrap_or_else(|e| e.into_inner());
    // the shell forks sleep, which inherits the output pipes
    let fake = FakeMuser::new("sleep 30\necho 'v 1 2 0'");
    let muser = Muser::new(fake.path())
        .unwrap()
        .with_time_limit(Duration::from_millis(300));
    let mut solver = SubsetSolver::with_strategy(&pair_conflict(), MinimizationStrategy::ExternalDelegate(muser));

    let start = Instant::now();
    let res = solver.shrink([0, 1, 2], &BTreeSet::new());
    assert!(matches!(res, Err(SubsetError::Minimizer(MuserError::Timeout(_)))));
    assert!(start.elapsed() < Duration::from_secs(10));
}

/// Blocks in a delegated shrink until terminated, when started by `test_termination_signal_cleans_up`.
#[test]
fn interrupted_shrink() {
    let Ok(dir) = std::env::var(INTERRUPTED_DIR) else {
        return;
    };
    let muser = Muser::new(Path::new(&dir).join("muser2")).unwrap();
    let mut solver = SubsetSolver::with_strategy(&pair_conflict(), MinimizationStrategy::ExternalDelegate(muser));
    let _ = solver.shrink([0, 1, 2], &BTreeSet::new());
    // the termination handler exits the process in the meantime
    thread::sleep(Duration::from_secs(30));
    panic!("not terminated");
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(20), "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_termination_signal_cleans_up() {
    let _lock = SEQUENTIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fake = FakeMuser::new(
        "echo \"$5\" > \"$DIR/last_path\"\necho $$ > \"$DIR/pid.tmp\"\nmv \"$DIR/pid.tmp\" \"$DIR/pid\"\nexec sleep 30",
    );
    let mut helper = Command::new(std::env::current_exe().unwrap())
        .args(["interrupted_shrink", "--exact", "--nocapture", "--test-threads=1"])
        .env(INTERRUPTED_DIR, fake.dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_until("MUSer2 to start", || fake.dir.path().join("pid").exists());
    let muser = Pid::from_raw(fake.read("pid").trim().parse().unwrap());
    let cnf = PathBuf::from(fake.read("last_path").trim());
    assert!(cnf.exists());

    kill(Pid::from_raw(helper.id() as i32), Signal::SIGTERM).unwrap();
    let status = helper.wait().unwrap();
    assert_eq!(status.code(), Some(INTERRUPTED_EXIT_CODE));
    assert!(!cnf.exists());
    wait_until("MUSer2 to exit", || kill(muser, None::<Signal>).is_err());
}
