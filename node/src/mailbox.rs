//! Git-backed `Mailbox`: clones (or reuses) a local working copy of the
//! bulletin-board repository and posts/reads files through it — sync via
//! fetch + hard reset, post via write+fsync, add, commit, push, with
//! jittered retry on lock contention.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::{FetchOptions, RemoteCallbacks, Repository, ResetType};
use mpc_core::traits::Mailbox;
use mpc_core::{MpcError, Result};
use rand::Rng;
use tracing::{debug, warn};

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct GitMailbox {
    repo_url: String,
    local_path: PathBuf,
    node_id: String,
}

impl GitMailbox {
    pub fn open(repo_url: &str, local_path: impl Into<PathBuf>, node_id: &str) -> Result<Self> {
        let local_path = local_path.into();
        let mailbox =
            GitMailbox { repo_url: repo_url.to_string(), local_path, node_id: node_id.to_string() };
        mailbox.ensure_cloned()?;
        Ok(mailbox)
    }

    fn ensure_cloned(&self) -> Result<()> {
        if self.local_path.join(".git").exists() {
            return Ok(())
        }
        if self.local_path.exists() {
            fs::remove_dir_all(&self.local_path).map_err(|e| MpcError::MailboxError(e.to_string()))?;
        }
        if let Some(parent) = self.local_path.parent() {
            fs::create_dir_all(parent).map_err(|e| MpcError::MailboxError(e.to_string()))?;
        }

        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match Repository::clone(&self.repo_url, &self.local_path) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "mailbox clone failed");
                    last_err = Some(e);
                    std::thread::sleep(RETRY_DELAY);
                },
            }
        }
        Err(MpcError::MailboxError(format!(
            "failed to clone {}: {}",
            self.repo_url,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.local_path).map_err(|e| MpcError::MailboxError(e.to_string()))
    }

    fn reset_hard_to_origin(&self, repo: &Repository) -> Result<()> {
        let reference = repo
            .find_reference("refs/remotes/origin/master")
            .map_err(|e| MpcError::MailboxError(e.to_string()))?;
        let object =
            reference.peel(git2::ObjectType::Commit).map_err(|e| MpcError::MailboxError(e.to_string()))?;
        repo.reset(&object, ResetType::Hard, None).map_err(|e| MpcError::MailboxError(e.to_string()))
    }
}

impl Mailbox for GitMailbox {
    fn sync(&self) -> Result<()> {
        let repo = self.repo()?;
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0.0..0.5 * attempt as f64);
                std::thread::sleep(RETRY_DELAY.mul_f64(attempt as f64) + Duration::from_secs_f64(jitter));
            }
            let mut remote =
                match repo.find_remote("origin").map_err(|e| MpcError::MailboxError(e.to_string())) {
                    Ok(r) => r,
                    Err(e) => return Err(e),
                };
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(|_, _, _| git2::Cred::ssh_key_from_agent("git"));
            let mut fetch_options = FetchOptions::new();
            fetch_options.remote_callbacks(callbacks);

            match remote.fetch(&["master"], Some(&mut fetch_options), None) {
                Ok(()) => return self.reset_hard_to_origin(&repo),
                Err(e) => {
                    debug!(attempt, error = %e, "mailbox sync fetch failed, retrying");
                    continue
                },
            }
        }
        warn!("mailbox sync exhausted retries");
        Ok(())
    }

    fn post(&self, path: &str, data: &[u8]) -> Result<()> {
        for attempt in 0..RETRY_ATTEMPTS {
            self.sync()?;
            let repo = self.repo()?;

            let full_path = self.local_path.join(path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).map_err(|e| MpcError::MailboxError(e.to_string()))?;
            }
            write_and_fsync(&full_path, data).map_err(|e| MpcError::MailboxError(e.to_string()))?;

            let mut index =
                repo.index().map_err(|e| MpcError::MailboxError(e.to_string()))?;
            index.add_path(Path::new(path)).map_err(|e| MpcError::MailboxError(e.to_string()))?;
            index.write().map_err(|e| MpcError::MailboxError(e.to_string()))?;

            let tree_id = index.write_tree().map_err(|e| MpcError::MailboxError(e.to_string()))?;
            let tree = repo.find_tree(tree_id).map_err(|e| MpcError::MailboxError(e.to_string()))?;
            let signature = git2::Signature::now(&self.node_id, "mpc-node@localhost")
                .map_err(|e| MpcError::MailboxError(e.to_string()))?;
            let parent =
                repo.head().ok().and_then(|h| h.peel_to_commit().ok());
            let parents: Vec<&git2::Commit> = parent.iter().collect();
            let commit_result = repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                &format!("{}: posted {path}", self.node_id),
                &tree,
                &parents,
            );
            if commit_result.is_err() {
                return Ok(()) // nothing to commit
            }

            let mut remote =
                repo.find_remote("origin").map_err(|e| MpcError::MailboxError(e.to_string()))?;
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(|_, _, _| git2::Cred::ssh_key_from_agent("git"));
            let mut push_options = git2::PushOptions::new();
            push_options.remote_callbacks(callbacks);
            match remote.push(&["refs/heads/master:refs/heads/master"], Some(&mut push_options)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "mailbox push failed, resetting and retrying");
                    let _ = self.reset_hard_to_origin(&repo);
                    std::thread::sleep(RETRY_DELAY.mul_f64((attempt + 1) as f64));
                },
            }
        }
        Err(MpcError::MailboxError(format!("failed to post {path} after {RETRY_ATTEMPTS} attempts")))
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.sync()?;
        let full_path = self.local_path.join(path);
        if !full_path.exists() {
            return Ok(None)
        }
        fs::read(&full_path).map(Some).map_err(|e| MpcError::MailboxError(e.to_string()))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.sync()?;
        let dir_path = self.local_path.join(dir);
        if !dir_path.exists() {
            return Ok(Vec::new())
        }
        // Returns both file and subdirectory names: callers that expect one
        // kind of entry (`.json` commitments, `request_id` subdirectories
        // under `signing/`) filter or consume the name as appropriate.
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir_path).map_err(|e| MpcError::MailboxError(e.to_string()))? {
            let entry = entry.map_err(|e| MpcError::MailboxError(e.to_string()))?;
            let is_git = entry.file_name() == ".git";
            if is_git {
                continue
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }
}

fn write_and_fsync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}
