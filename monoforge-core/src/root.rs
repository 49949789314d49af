//! Workspace root discovery.
//!
//! The root is the closest directory carrying a version-control directory, a
//! lock file or a pnpm workspace manifest. Candidates are grouped in tiers
//! that are probed concurrently but decided strictly by tier priority.

use std::future::Future;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::error::Result;

/// Environment variable package managers set to the directory a script was
/// launched from.
pub const INIT_CWD_ENV: &str = "INIT_CWD";

const PACKAGES_SEGMENT: &str = "packages";
const NODE_MODULES_SEGMENT: &str = "node_modules";

/// Filesystem entries whose presence marks a workspace root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerFile {
    Git,
    YarnLock,
    PnpmLock,
    NpmLock,
    PnpmWorkspace,
}

impl MarkerFile {
    pub const ALL: [MarkerFile; 5] = [
        MarkerFile::Git,
        MarkerFile::YarnLock,
        MarkerFile::PnpmLock,
        MarkerFile::NpmLock,
        MarkerFile::PnpmWorkspace,
    ];

    #[inline]
    pub fn file_name(self) -> &'static str {
        match self {
            MarkerFile::Git => ".git",
            MarkerFile::YarnLock => "yarn.lock",
            MarkerFile::PnpmLock => "pnpm-lock.yaml",
            MarkerFile::NpmLock => "package-lock.json",
            MarkerFile::PnpmWorkspace => "pnpm-workspace.yaml",
        }
    }
}

/// Directories probed together. Earlier tiers win over later ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTier {
    dirs: Vec<PathBuf>,
}

impl CandidateTier {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

/// Builds the candidate tiers for `start`, highest priority first.
///
/// 1. `start` itself.
/// 2. `start` cut before its last `/packages` and its last `/node_modules`
///    occurrence. The match is on the raw string, so `/packages-old` counts.
/// 3. The parent of `start`.
/// 4. The grandparent of `start`.
///
/// Tiers that would be empty are left out.
pub fn candidate_tiers(start: &Path) -> Vec<CandidateTier> {
    let mut tiers = vec![CandidateTier::new(vec![start.to_path_buf()])];

    let text = start.to_string_lossy();
    let structural: Vec<PathBuf> = [PACKAGES_SEGMENT, NODE_MODULES_SEGMENT]
        .iter()
        .filter_map(|segment| {
            let needle = format!("{}{}", MAIN_SEPARATOR, segment);
            text.rfind(&needle).map(|idx| &text[..idx])
        })
        .filter(|prefix| !prefix.is_empty())
        .map(PathBuf::from)
        .collect();
    if !structural.is_empty() {
        tiers.push(CandidateTier::new(structural));
    }

    let parent = start.parent().filter(|p| *p != start && !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        tiers.push(CandidateTier::new(vec![parent.to_path_buf()]));
        let grandparent = parent
            .parent()
            .filter(|p| *p != parent && !p.as_os_str().is_empty());
        if let Some(grandparent) = grandparent {
            tiers.push(CandidateTier::new(vec![grandparent.to_path_buf()]));
        }
    }

    tiers
}

/// Answers whether a directory directly contains a root marker.
#[async_trait]
pub trait MarkerProbe: Send + Sync {
    async fn has_marker(&self, dir: &Path) -> bool;
}

/// Probes the real filesystem, checking every marker concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

#[async_trait]
impl MarkerProbe for FsProbe {
    async fn has_marker(&self, dir: &Path) -> bool {
        let checks = MarkerFile::ALL.iter().map(|marker| {
            let path = dir.join(marker.file_name());
            async move { tokio::fs::try_exists(&path).await.unwrap_or(false) }
        });
        join_all(checks).await.into_iter().any(|found| found)
    }
}

/// First directory of `tier`, in tier order, that holds a marker.
async fn probe_tier(probe: &dyn MarkerProbe, tier: &CandidateTier) -> Option<PathBuf> {
    let found = join_all(tier.dirs().iter().map(|dir| probe.has_marker(dir))).await;
    tier.dirs()
        .iter()
        .zip(found)
        .find(|(_, found)| *found)
        .map(|(dir, _)| dir.clone())
}

/// Polls every slot concurrently and returns the value of the lowest-index
/// slot that produced `Some`.
///
/// A slot is only committed once every slot before it has reported `None`,
/// so a fast low-priority slot never beats a slow high-priority one.
pub async fn first_by_priority<F, T>(slots: Vec<F>) -> Option<T>
where
    F: Future<Output = Option<T>>,
{
    let total = slots.len();
    let mut pending: FuturesUnordered<_> = slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| async move { (idx, slot.await) })
        .collect();

    let mut reported: Vec<Option<Option<T>>> = (0..total).map(|_| None).collect();
    let mut next = 0;

    while let Some((idx, value)) = pending.next().await {
        reported[idx] = Some(value);
        while next < total {
            match reported[next].take() {
                Some(Some(found)) => return Some(found),
                Some(None) => next += 1,
                None => break,
            }
        }
    }

    None
}

/// Resolves the workspace root without caching. Never fails: when no tier
/// holds a marker, `start` is returned unchanged.
pub async fn locate_root(probe: &dyn MarkerProbe, start: &Path) -> PathBuf {
    let tiers = candidate_tiers(start);
    trace!(start = %start.display(), tiers = ?tiers, "probing workspace root candidates");

    let slots: Vec<_> = tiers.iter().map(|tier| probe_tier(probe, tier)).collect();
    match first_by_priority(slots).await {
        Some(root) => root,
        None => {
            debug!(start = %start.display(), "no workspace marker found, using start directory");
            start.to_path_buf()
        }
    }
}

/// Walks `start` and its ancestors, stopping at the first directory that
/// contains one of `names`. Returns the path of the matching entry.
pub fn find_up(start: &Path, names: &[&str]) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        names
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.exists())
    })
}

/// Memoizing workspace root resolver.
///
/// The first resolved root is kept for the lifetime of the resolver. Later
/// calls return it even when asked about another directory, so one resolver
/// should serve one tool invocation.
pub struct WorkspaceRootResolver {
    probe: Arc<dyn MarkerProbe>,
    root: OnceCell<PathBuf>,
}

impl Default for WorkspaceRootResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceRootResolver {
    pub fn new() -> Self {
        Self::with_probe(FsProbe)
    }

    pub fn with_probe(probe: impl MarkerProbe + 'static) -> Self {
        Self {
            probe: Arc::new(probe),
            root: OnceCell::new(),
        }
    }

    pub async fn resolve(&self, start: &Path) -> &Path {
        self.root
            .get_or_init(|| async {
                let root = locate_root(self.probe.as_ref(), start).await;
                debug!(root = %root.display(), "resolved workspace root");
                root
            })
            .await
            .as_path()
    }

    /// Resolves from `INIT_CWD` when set, else from the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be read.
    pub async fn resolve_from_env(&self) -> Result<&Path> {
        if let Some(root) = self.root.get() {
            return Ok(root.as_path());
        }
        let start = match std::env::var_os(INIT_CWD_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::current_dir()?,
        };
        Ok(self.resolve(&start).await)
    }

    pub fn cached(&self) -> Option<&Path> {
        self.root.get().map(PathBuf::as_path)
    }
}
