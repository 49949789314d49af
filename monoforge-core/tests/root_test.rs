#![cfg(unix)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use monoforge_core::root::{find_up, locate_root, MarkerProbe, WorkspaceRootResolver};
use monoforge_core::Context;
use tempfile::TempDir;

/// Answers from a fixed table after a per-directory delay.
struct ScriptedProbe {
    answers: HashMap<PathBuf, (Duration, bool)>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    fn new(answers: &[(&str, u64, bool)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(dir, delay, found)| {
                    (PathBuf::from(dir), (Duration::from_millis(*delay), *found))
                })
                .collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl MarkerProbe for ScriptedProbe {
    async fn has_marker(&self, dir: &Path) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answers.get(dir) {
            Some((delay, found)) => {
                tokio::time::sleep(*delay).await;
                *found
            }
            None => false,
        }
    }
}

#[tokio::test]
async fn test_marker_at_grandparent() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::create_dir(root.join(".git")).unwrap();
    let start = root.join("a").join("b");
    fs::create_dir_all(&start).unwrap();

    let resolver = WorkspaceRootResolver::new();
    assert_eq!(resolver.resolve(&start).await, root);
}

#[tokio::test]
async fn test_marker_in_parent_beats_grandparent() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::write(root.join("yarn.lock"), "").unwrap();
    fs::create_dir_all(root.join("a").join("b")).unwrap();
    fs::write(root.join("a").join("pnpm-lock.yaml"), "").unwrap();

    let resolver = WorkspaceRootResolver::new();
    let start = root.join("a").join("b");
    assert_eq!(resolver.resolve(&start).await, root.join("a"));
}

#[tokio::test]
async fn test_no_marker_returns_start() {
    let temp_dir = TempDir::new().unwrap();
    let start = temp_dir.path().join("x").join("y").join("z");
    fs::create_dir_all(&start).unwrap();

    let resolver = WorkspaceRootResolver::new();
    assert_eq!(resolver.resolve(&start).await, start);
}

#[tokio::test]
async fn test_structural_candidate_reaches_past_grandparent() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::write(root.join("pnpm-workspace.yaml"), "packages:\n  - packages/*\n").unwrap();
    let start = root.join("packages").join("app").join("src").join("lib");
    fs::create_dir_all(&start).unwrap();

    let resolver = WorkspaceRootResolver::new();
    assert_eq!(resolver.resolve(&start).await, root);
}

#[tokio::test]
async fn test_marker_inside_start_directory_wins() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::create_dir(root.join(".git")).unwrap();
    let start = root.join("node_modules").join("dep");
    fs::create_dir_all(&start).unwrap();
    fs::write(start.join("package-lock.json"), "{}").unwrap();

    let resolver = WorkspaceRootResolver::new();
    assert_eq!(resolver.resolve(&start).await, start);
}

#[tokio::test]
async fn test_priority_beats_completion_order() {
    // Tiers: [/w/packages/app], [/w], [/w/packages], [/w]
    let probe = ScriptedProbe::new(&[
        ("/w/packages/app", 150, true),
        ("/w", 0, true),
        ("/w/packages", 0, true),
    ]);

    let root = locate_root(&probe, Path::new("/w/packages/app")).await;
    assert_eq!(root, PathBuf::from("/w/packages/app"));
}

#[tokio::test]
async fn test_slow_empty_tier_defers_to_next() {
    let probe = ScriptedProbe::new(&[
        ("/w/packages/app", 100, false),
        ("/w/packages", 0, true),
        ("/w", 50, true),
    ]);

    let root = locate_root(&probe, Path::new("/w/packages/app")).await;
    assert_eq!(root, PathBuf::from("/w"));
}

#[tokio::test]
async fn test_all_tiers_probed_concurrently() {
    let probe = ScriptedProbe::new(&[
        ("/w/packages/app", 200, false),
        ("/w", 200, false),
        ("/w/packages", 200, false),
    ]);

    let started = std::time::Instant::now();
    let root = locate_root(&probe, Path::new("/w/packages/app")).await;

    assert_eq!(root, PathBuf::from("/w/packages/app"));
    assert!(started.elapsed() < Duration::from_millis(600));
    assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_resolver_memoizes_first_result() {
    let probe = ScriptedProbe::new(&[("/first", 0, true)]);
    let calls = Arc::clone(&probe.calls);
    let resolver = WorkspaceRootResolver::with_probe(probe);

    assert_eq!(resolver.cached(), None);
    let first = resolver.resolve(Path::new("/first")).await.to_path_buf();
    let probes_after_first = calls.load(Ordering::SeqCst);
    let second = resolver.resolve(Path::new("/second/elsewhere")).await;

    assert_eq!(first, PathBuf::from("/first"));
    assert_eq!(second, Path::new("/first"));
    assert_eq!(calls.load(Ordering::SeqCst), probes_after_first);
    assert_eq!(resolver.cached(), Some(Path::new("/first")));
}

#[tokio::test]
async fn test_context_uses_supplied_resolver() {
    let probe = ScriptedProbe::new(&[("/work/repo", 0, true)]);
    let ctx = Context::with_resolver(WorkspaceRootResolver::with_probe(probe));

    let root = ctx.root(Path::new("/work/repo/packages/app")).await;
    assert_eq!(root, Path::new("/work/repo"));
    assert_eq!(ctx.root_from_env().await.unwrap(), Path::new("/work/repo"));
    assert_eq!(ctx.inherited_exit_code(), None);
}

#[test]
fn test_find_up_stops_at_nearest() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let nested = root.join("a").join("b").join("c");
    fs::create_dir_all(&nested).unwrap();
    fs::write(root.join("monoforge.toml"), "").unwrap();
    fs::write(root.join("a").join("monoforge.toml"), "").unwrap();

    assert_eq!(
        find_up(&nested, &["monoforge.toml"]),
        Some(root.join("a").join("monoforge.toml"))
    );
}

#[test]
fn test_find_up_without_match() {
    let temp_dir = TempDir::new().unwrap();
    assert_eq!(
        find_up(temp_dir.path(), &["monoforge-missing-marker.toml"]),
        None
    );
}
