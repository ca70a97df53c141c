use core::fmt;
use core::fmt::Display;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::{io, process};

use anyhow::{ensure, Context as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard, Semaphore, SemaphorePermit};

use crate::process::{CommandExt as _, OutputExt as _};

// A CommitHash names a commit object in a git repository. Note that holding
// one doesn't guarantee the commit exists in any actual repo; even if we
// checked at construction time it couldn't be enforced going forward, so
// error handling stays at the point of use, like with any mutable database.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    // Untrusted input (a Live spec) goes through here instead of new.
    pub fn parse(s: impl Into<String>) -> anyhow::Result<Self> {
        let s = s.into();
        let bytes = hex::decode(&s).with_context(|| format!("commit id {s:?} is not hex"))?;
        ensure!(
            bytes.len() == 20,
            "commit id must be 40 hex characters, got {:?}",
            s
        );
        Ok(Self(s))
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        OsStr::new(&self.0)
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTPS basic-auth credentials for the remote. The password is normally a
/// personal-access token; the username only has to be non-empty.
#[derive(Clone)]
pub struct GitAuth {
    pub username: String,
    pub password: String,
}

// Keep the token out of logs and error chains.
impl fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

const AUTH_USERNAME_ENV: &str = "KUBERIK_GIT_USERNAME";
const AUTH_PASSWORD_ENV: &str = "KUBERIK_GIT_PASSWORD";

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

// Wrapper for a Command, that holds a semaphore for as long as the process
// exists. Just delegates enough methods to allow you to use it without
// letting you drop the semaphore until the process has terminated (which
// hopefully implies the stdio pipes have been closed...).
// This exists to try and avoid running into file descriptor exhaustion, without
// needing any retry logic that would risk creating livelocks.
#[derive(Debug)]
struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        self.command.execute().await
    }

    async fn output(&mut self) -> io::Result<process::Output> {
        self.command.output().await
    }
}

// The cache directories are shared between the Live controller and the
// polling controllers, which hold separate handles. Serialise operations
// process-wide per cache root so the on-disk state stays single-writer.
static REPO_LOCKS: LazyLock<parking_lot::Mutex<HashMap<PathBuf, Arc<TokioMutex<()>>>>> =
    LazyLock::new(Default::default);

/// Content-addressed, append-only cache of one remote repository: a bare
/// object store under `<root>/repo` plus one shared-storage worktree per
/// materialised commit under `<root>/commits/<sha>`.
#[derive(Debug)]
pub struct GitRepository {
    root: PathBuf,
    auth: Option<GitAuth>,
}

impl GitRepository {
    /// Opens (or creates) the cache at `root` for the given remote.
    /// Idempotent: re-initialising an existing store succeeds and updates the
    /// origin URL.
    pub async fn init(
        root: impl Into<PathBuf>,
        url: &str,
        auth: Option<GitAuth>,
    ) -> anyhow::Result<GitRepository> {
        let zelf = Self {
            root: root.into(),
            auth,
        };
        fs::create_dir_all(zelf.repo_dir())
            .await
            .with_context(|| format!("creating {:?}", zelf.repo_dir()))?;
        fs::create_dir_all(zelf.commits_dir())
            .await
            .with_context(|| format!("creating {:?}", zelf.commits_dir()))?;
        // git init re-runs cleanly on an existing store.
        zelf.git(["init", "--bare", "--quiet"])
            .await
            .execute()
            .await
            .context("initialising bare object store")?;
        let added = zelf
            .git(["remote", "add", "origin"])
            .await
            .arg(url)
            .output()
            .await?;
        if !added.status.success() {
            zelf.git(["remote", "set-url", "origin"])
                .await
                .arg(url)
                .execute()
                .await
                .context("configuring origin remote")?;
        }
        Ok(zelf)
    }

    fn repo_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    fn commits_dir(&self) -> PathBuf {
        self.root.join("commits")
    }

    async fn lock(&self) -> OwnedMutexGuard<()> {
        let mutex = REPO_LOCKS
            .lock()
            .entry(self.root.clone())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }

    async fn git<I, S>(&self, args: I) -> GitCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_in(&self.repo_dir(), args).await
    }

    // Convenience function to create a git command with some pre-filled args.
    async fn git_in<I, S>(&self, dir: &Path, args: I) -> GitCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.current_dir(dir);
        if let Some(auth) = &self.auth {
            // Feed credentials through a helper reading our env vars, so the
            // token never lands in argv or on-disk config. The empty helper
            // first clears any helpers inherited from the host.
            cmd.args(["-c", "credential.helper="]);
            cmd.arg("-c");
            cmd.arg(format!(
                "credential.helper=!f() {{ echo \"username=${{{AUTH_USERNAME_ENV}}}\"; \
                 echo \"password=${{{AUTH_PASSWORD_ENV}}}\"; }}; f"
            ));
            cmd.env(AUTH_USERNAME_ENV, &auth.username);
            cmd.env(AUTH_PASSWORD_ENV, &auth.password);
        }
        cmd.args(args);
        // Separate process group means the child doesn't get SIGINT if the
        // user Ctrl-C's the terminal. We are trusting that git won't get stuck
        // and prevent us from shutting down.
        cmd.process_group(0);
        GitCommand {
            _permit: COMMAND_SEM.acquire().await.unwrap(),
            command: cmd,
        }
    }

    /// Fetches the tip of a branch with depth 1 and returns the commit it
    /// resolved to. The remote-tracking ref is force-updated, so rewritten
    /// branches at the origin are reflected. "Already up to date" is success.
    pub async fn fetch_branch(&self, name: &str) -> anyhow::Result<CommitHash> {
        let _lock = self.lock().await;
        self.git(["fetch", "--depth", "1", "origin"])
            .await
            .arg(format!("+refs/heads/{name}:refs/remotes/origin/{name}"))
            .execute()
            .await
            .with_context(|| format!("fetching branch {name:?}"))?;
        let output = self
            .git(["rev-parse", "--verify"])
            .await
            .arg(format!("refs/remotes/origin/{name}"))
            .execute()
            .await
            .with_context(|| format!("resolving fetched branch {name:?}"))?;
        CommitHash::parse(output.stdout_string()?.trim())
    }

    /// Makes sure the commit object is present locally, fetching it by SHA
    /// with depth 1 if it isn't. Requires the remote to permit reachable-SHA
    /// fetches (uploadpack.allowReachableSHA1InWant).
    pub async fn fetch_commit(&self, commit: &CommitHash) -> anyhow::Result<()> {
        let _lock = self.lock().await;
        let present = self
            .git(["cat-file", "-e"])
            .await
            .arg(format!("{commit}^{{commit}}"))
            .output()
            .await?;
        if present.status.success() {
            debug!("commit {} already present, skipping fetch", commit.abbrev());
            return Ok(());
        }
        self.git(["fetch", "--depth", "1", "origin"])
            .await
            .arg(format!("+{commit}:refs/remotes/origin/commit-{commit}"))
            .execute()
            .await
            .with_context(|| format!("fetching commit {commit}"))?;
        Ok(())
    }

    /// Produces `<root>/commits/<sha>` holding the worktree of that commit.
    /// Forced and idempotent: whatever state a previous materialisation (or a
    /// crash) left behind, the tree afterwards is exactly the commit's.
    pub async fn materialise_commit(&self, commit: &CommitHash) -> anyhow::Result<PathBuf> {
        let _lock = self.lock().await;
        let dest = self.commits_dir().join(AsRef::<str>::as_ref(commit));
        if dest.join(".git").exists() {
            self.git_in(&dest, ["reset", "--hard"])
                .await
                .arg(commit)
                .execute()
                .await
                .with_context(|| format!("re-checking out {commit} in {dest:?}"))?;
            self.git_in(&dest, ["clean", "-ffd"])
                .await
                .execute()
                .await
                .with_context(|| format!("cleaning worktree {dest:?}"))?;
        } else {
            if dest.exists() {
                // Stale directory that isn't a registered worktree (e.g. the
                // object store was recreated under it).
                fs::remove_dir_all(&dest)
                    .await
                    .with_context(|| format!("removing stale commit dir {dest:?}"))?;
            }
            self.git(["worktree", "add", "--detach", "--force"])
                .await
                .arg(&dest)
                .arg(commit)
                .execute()
                .await
                .with_context(|| format!("materialising {commit} at {dest:?}"))?;
        }
        Ok(dest)
    }

    /// Lists remote branches whose short name matches the pattern, sorted.
    /// An empty pattern matches everything. This is a network call.
    pub async fn list_branches(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let matcher = Regex::new(pattern).context("compiling branch match pattern")?;
        let _lock = self.lock().await;
        let output = self
            .git(["ls-remote", "--heads", "origin"])
            .await
            .execute()
            .await
            .context("listing remote branches")?;
        let stdout = output.stdout_string()?;
        let mut branches: Vec<String> = stdout
            .lines()
            .filter_map(|line| line.split('\t').nth(1))
            .filter_map(|r| r.strip_prefix("refs/heads/"))
            .filter(|b| matcher.is_match(b))
            .map(str::to_owned)
            .collect();
        branches.sort();
        Ok(branches)
    }
}

#[cfg(test)]
pub mod test_utils {
    use tempfile::TempDir;

    use super::*;
    use crate::process::{CommandExt as _, OutputExt as _};

    // A local "remote": a normal repository in a temporary directory that the
    // cache can fetch from by path, torn down on drop. Reachable-SHA fetches
    // are enabled like the controller expects of real remotes.
    #[derive(Debug)]
    pub struct TempRemote {
        temp_dir: TempDir,
    }

    impl TempRemote {
        pub async fn new() -> anyhow::Result<Self> {
            let zelf = Self {
                temp_dir: TempDir::with_prefix("remote-").expect("couldn't make tempdir"),
            };
            zelf.git(["init", "--quiet", "--initial-branch", "main"])
                .execute()
                .await?;
            zelf.git(["config", "uploadpack.allowReachableSHA1InWant", "true"])
                .execute()
                .await?;
            zelf.git(["config", "user.name", "John Doe"]).execute().await?;
            zelf.git(["config", "user.email", "john@doe.org"])
                .execute()
                .await?;
            Ok(zelf)
        }

        pub fn url(&self) -> String {
            self.temp_dir.path().display().to_string()
        }

        fn git<I, S>(&self, args: I) -> Command
        where
            I: IntoIterator<Item = S>,
            S: AsRef<OsStr>,
        {
            let mut cmd = Command::new("git");
            cmd.current_dir(self.temp_dir.path());
            cmd.args(args);
            cmd
        }

        // Writes the given files, stages everything and commits, returning
        // the new HEAD.
        pub async fn commit_files(
            &self,
            files: &[(&str, &str)],
            message: &str,
        ) -> anyhow::Result<CommitHash> {
            for (path, contents) in files {
                let path = self.temp_dir.path().join(path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&path, contents).await?;
            }
            self.git(["add", "-A"]).execute().await?;
            self.git(["commit", "--quiet", "--allow-empty", "-m", message])
                .execute()
                .await
                .context("'git commit' failed")?;
            self.head().await
        }

        pub async fn head(&self) -> anyhow::Result<CommitHash> {
            let output = self.git(["rev-parse", "HEAD"]).execute().await?;
            CommitHash::parse(output.stdout_string()?.trim())
        }

        pub async fn branch(&self, name: &str) -> anyhow::Result<()> {
            self.git(["branch", name]).execute().await?;
            Ok(())
        }

        pub async fn delete_branch(&self, name: &str) -> anyhow::Result<()> {
            self.git(["branch", "-D", name]).execute().await?;
            Ok(())
        }

        pub async fn reset_hard(&self, commit: &CommitHash) -> anyhow::Result<()> {
            self.git(["reset", "--hard"]).arg(commit).execute().await?;
            Ok(())
        }
    }
}
