use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backfill_infra::ProcessGitRunner;
use backfill_orchestrator::{CheckoutMode, GitError, GitRunner, RepositoryRetriever};

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

async fn git(runner: &ProcessGitRunner, cwd: &Path, parts: &[&str]) {
    runner
        .run(cwd, &args(parts))
        .await
        .unwrap_or_else(|e| panic!("git {parts:?} failed: {e}"));
}

/// Local repository with a nested file, a sibling directory and a root file.
async fn source_repo(runner: &ProcessGitRunner, root: &Path) {
    for (path, content) in [
        ("top.txt", "top"),
        ("a/b/c.txt", "c"),
        ("a/b/sibling.txt", "s"),
        ("d/e.txt", "e"),
    ] {
        let target = root.join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, content).unwrap();
    }
    git(runner, root, &["init", "--quiet"]).await;
    git(runner, root, &["config", "uploadpack.allowFilter", "true"]).await;
    git(runner, root, &["config", "uploadpack.allowAnySHA1InWant", "true"]).await;
    git(runner, root, &["add", "."]).await;
    git(
        runner,
        root,
        &[
            "-c",
            "user.name=Backfill",
            "-c",
            "user.email=backfill@example.com",
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--quiet",
            "-m",
            "init",
        ],
    )
    .await;
}

#[tokio::test]
async fn repeated_sparse_fetch_against_real_git() {
    let runner = ProcessGitRunner::new(Duration::from_secs(30));
    let scratch = tempfile::tempdir().unwrap();
    if let Err(GitError::Spawn(err)) = runner.run(scratch.path(), &args(&["--version"])).await {
        eprintln!("git unavailable, skipping: {err}");
        return;
    }

    let source = scratch.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    source_repo(&runner, &source).await;

    let work = scratch.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let retriever = RepositoryRetriever::new(Arc::new(runner));
    let url = format!("file://{}", source.display());
    let snapshot = retriever.clone_repository(&url, None, &work).await.unwrap();
    assert!(!snapshot.is_empty());

    let requested = args(&["a/b/c.txt", "top.txt"]);
    let first = retriever.fetch_paths(&snapshot, &requested).await.unwrap();
    let second = retriever.fetch_paths(&snapshot, &requested).await.unwrap();

    assert_eq!(first.mode, CheckoutMode::Sparse);
    assert_eq!(second.mode, CheckoutMode::Sparse);
    assert!(second.missing.is_empty());
    assert_eq!(second.materialized, first.materialized);
    assert!(snapshot.path().join("a/b/c.txt").exists());
    assert!(snapshot.path().join("top.txt").exists());
    assert!(!snapshot.path().join("d/e.txt").exists());
}
